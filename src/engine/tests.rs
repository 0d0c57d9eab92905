use super::*;
use crate::authz::{Principal, RequestContext};
use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// First `weekday` at least a week out, so the date never becomes past mid-test.
fn upcoming(weekday: Weekday) -> NaiveDate {
    let mut date = conflict::today() + Days::new(7);
    while date.weekday() != weekday {
        date = date.succ_opt().unwrap();
    }
    date
}

fn ctx(engine: &Engine, email: &str) -> RequestContext {
    RequestContext::new(engine.resolve_principal(email))
}

fn anonymous() -> RequestContext {
    RequestContext::new(Principal::anonymous())
}

const ADMIN: &str = "admin@uni.example";
const ANA: &str = "ana@uni.example";
const LUIS: &str = "luis@uni.example";

fn new_user(name: &str, email: &str, role: Role) -> NewUser {
    NewUser {
        id: None,
        name: Some(name.into()),
        email: Some(email.into()),
        password: Some("secret-1".into()),
        roles: Some(Roles::single(role)),
    }
}

/// Engine with an administrator, two professors, one room and three Monday slots
/// (08–10, 09–11, 10–12).
struct Fixture {
    engine: Arc<Engine>,
    admin: RequestContext,
    ana: RequestContext,
    luis: RequestContext,
    room: Room,
    slots: [TimeSlot; 3],
}

impl Fixture {
    async fn new(name: &str) -> Self {
        Self::open(Engine::new(test_wal_path(name)).unwrap()).await
    }

    async fn open(engine: Engine) -> Self {
        let engine = Arc::new(engine);
        engine
            .register_user(&anonymous(), new_user("Admin", ADMIN, Role::Admin))
            .await
            .unwrap();
        for (name, email) in [("Ana", ANA), ("Luis", LUIS)] {
            engine
                .register_user(&anonymous(), new_user(name, email, Role::Profesor))
                .await
                .unwrap();
        }
        let admin = ctx(&engine, ADMIN);
        let room = engine
            .create_room(&admin, NewRoom { id: None, name: "Aula 1".into(), capacity: 30, has_computers: true })
            .await
            .unwrap();
        let mut slots = Vec::new();
        for (start, end) in [(8, 10), (9, 11), (10, 12)] {
            let slot = engine
                .create_time_slot(
                    &admin,
                    NewTimeSlot { id: None, day: DayOfWeek::Monday, start: t(start, 0), end: t(end, 0) },
                )
                .await
                .unwrap();
            slots.push(slot);
        }
        Self {
            ana: ctx(&engine, ANA),
            luis: ctx(&engine, LUIS),
            admin,
            room,
            slots: slots.try_into().unwrap(),
            engine,
        }
    }

    fn booking(&self, slot: usize, attendees: u32) -> NewBooking {
        NewBooking {
            id: None,
            date: upcoming(Weekday::Mon),
            reason: Some("Clase".into()),
            attendees,
            room_id: self.room.id,
            time_slot_id: self.slots[slot].id,
        }
    }

    async fn second_room(&self) -> Room {
        self.engine
            .create_room(&self.admin, NewRoom { id: None, name: "Aula 2".into(), capacity: 10, has_computers: false })
            .await
            .unwrap()
    }
}

// ── Conflict validation ──────────────────────────────────

#[tokio::test]
async fn overlapping_slot_on_same_date_is_rejected() {
    let f = Fixture::new("overlap.wal").await;

    let first = assert_ok!(f.engine.create_booking(&f.ana, f.booking(0, 20)).await);
    let err = assert_err!(f.engine.create_booking(&f.luis, f.booking(1, 20)).await);
    assert!(matches!(err, EngineError::Overlap(id) if id == first.booking.id));

    // 10:00–12:00 only touches 08:00–10:00
    assert_ok!(f.engine.create_booking(&f.luis, f.booking(2, 20)).await);
    assert_eq!(f.engine.list_bookings(&f.admin).await.unwrap().len(), 2);
}

#[tokio::test]
async fn same_slot_is_an_overlap() {
    let f = Fixture::new("same_slot.wal").await;
    let first = f.engine.create_booking(&f.ana, f.booking(0, 5)).await.unwrap();
    let err = f.engine.create_booking(&f.ana, f.booking(0, 5)).await.unwrap_err();
    assert!(matches!(err, EngineError::Overlap(id) if id == first.booking.id));
}

#[tokio::test]
async fn other_date_or_room_does_not_conflict() {
    let f = Fixture::new("no_conflict.wal").await;
    f.engine.create_booking(&f.ana, f.booking(0, 5)).await.unwrap();

    let mut next_week = f.booking(0, 5);
    next_week.date = next_week.date + Days::new(7);
    assert_ok!(f.engine.create_booking(&f.ana, next_week).await);

    let other = f.second_room().await;
    let mut elsewhere = f.booking(1, 5);
    elsewhere.room_id = other.id;
    assert_ok!(f.engine.create_booking(&f.ana, elsewhere).await);
}

#[tokio::test]
async fn capacity_is_inclusive() {
    let f = Fixture::new("capacity.wal").await;
    assert_ok!(f.engine.create_booking(&f.ana, f.booking(0, 30)).await);
    let err = assert_err!(f.engine.create_booking(&f.ana, f.booking(2, 31)).await);
    assert!(matches!(err, EngineError::CapacityExceeded { attendees: 31, capacity: 30 }));
}

#[tokio::test]
async fn past_date_reported_before_capacity() {
    let f = Fixture::new("past_first.wal").await;
    let mut input = f.booking(0, 500);
    input.date = conflict::today() - Days::new(1);
    let err = f.engine.create_booking(&f.ana, input).await.unwrap_err();
    assert!(matches!(err, EngineError::PastDate { .. }));
}

#[tokio::test]
async fn today_is_bookable() {
    let f = Fixture::new("today.wal").await;
    let mut input = f.booking(0, 1);
    input.date = conflict::today();
    assert_ok!(f.engine.create_booking(&f.ana, input).await);
}

#[tokio::test]
async fn zero_attendees_is_a_validation_error() {
    let f = Fixture::new("zero_attendees.wal").await;
    let err = f.engine.create_booking(&f.ana, f.booking(0, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "attendees", .. }));
}

#[tokio::test]
async fn unknown_references_are_not_found() {
    let f = Fixture::new("unknown_refs.wal").await;
    let mut input = f.booking(0, 1);
    input.room_id = Ulid::new();
    assert!(matches!(
        f.engine.create_booking(&f.ana, input).await,
        Err(EngineError::NotFound { entity: "room", .. })
    ));

    let mut input = f.booking(0, 1);
    input.time_slot_id = Ulid::new();
    assert!(matches!(
        f.engine.create_booking(&f.ana, input).await,
        Err(EngineError::NotFound { entity: "time slot", .. })
    ));
}

// ── Partial updates ──────────────────────────────────────

#[tokio::test]
async fn update_merges_and_keeps_creator() {
    let f = Fixture::new("update_merge.wal").await;
    let created = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();

    // Admin edits Ana's booking; she stays the owner
    let updated = f
        .engine
        .update_booking(&f.admin, created.booking.id, BookingPatch { attendees: Some(5), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(updated.booking.attendees, 5);
    assert_eq!(updated.booking.reason.as_deref(), Some("Clase"));
    assert_eq!(updated.booking.date, created.booking.date);
    assert_eq!(updated.booking.created_at, created.booking.created_at);
    assert_eq!(updated.creator.email, ANA);
}

#[tokio::test]
async fn empty_patch_does_not_conflict_with_itself() {
    let f = Fixture::new("update_noop.wal").await;
    let created = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let updated = assert_ok!(
        f.engine
            .update_booking(&f.ana, created.booking.id, BookingPatch::default())
            .await
    );
    assert_eq!(updated.booking, created.booking);
}

#[tokio::test]
async fn update_into_overlap_is_rejected() {
    let f = Fixture::new("update_overlap.wal").await;
    let first = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let second = f.engine.create_booking(&f.ana, f.booking(2, 2)).await.unwrap();

    let err = f
        .engine
        .update_booking(
            &f.ana,
            second.booking.id,
            BookingPatch { time_slot_id: Some(f.slots[1].id), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overlap(id) if id == first.booking.id));

    let unchanged = f.engine.get_booking(&f.ana, second.booking.id).await.unwrap();
    assert_eq!(unchanged.time_slot.id, f.slots[2].id);
}

#[tokio::test]
async fn update_into_past_date_is_rejected() {
    let f = Fixture::new("update_past.wal").await;
    let created = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();

    let err = f
        .engine
        .update_booking(
            &f.ana,
            created.booking.id,
            BookingPatch { date: Some(conflict::today() - Days::new(1)), attendees: Some(500), ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PastDate { .. }));
    let unchanged = f.engine.get_booking(&f.ana, created.booking.id).await.unwrap();
    assert_eq!(unchanged.booking, created.booking);
}

#[tokio::test]
async fn update_moves_booking_between_rooms() {
    let f = Fixture::new("update_move.wal").await;
    let other = f.second_room().await;
    let created = f.engine.create_booking(&f.ana, f.booking(0, 4)).await.unwrap();

    let moved = f
        .engine
        .update_booking(&f.ana, created.booking.id, BookingPatch { room_id: Some(other.id), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(moved.room.id, other.id);
    assert!(f.engine.room_bookings(&f.ana, f.room.id).await.unwrap().is_empty());
    assert_eq!(f.engine.room_bookings(&f.ana, other.id).await.unwrap().len(), 1);

    // Capacity is judged against the target room
    let err = f
        .engine
        .update_booking(&f.ana, created.booking.id, BookingPatch { attendees: Some(11), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { capacity: 10, .. }));
}

#[tokio::test]
async fn update_missing_booking_is_not_found() {
    let f = Fixture::new("update_missing.wal").await;
    let err = f
        .engine
        .update_booking(&f.ana, Ulid::new(), BookingPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "booking", .. }));
}

#[tokio::test]
async fn room_update_keeps_unset_fields() {
    let f = Fixture::new("room_update.wal").await;
    let room = f
        .engine
        .update_room(&f.admin, f.room.id, RoomPatch { capacity: Some(40), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(room.capacity, 40);
    assert_eq!(room.name, "Aula 1");
    assert!(room.has_computers);
}

#[tokio::test]
async fn time_slot_end_must_follow_start() {
    let f = Fixture::new("slot_order.wal").await;
    let err = f
        .engine
        .update_time_slot(&f.admin, f.slots[0].id, TimeSlotPatch { end: Some(t(8, 0)), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "end", .. }));
}

// ── Ownership ────────────────────────────────────────────

#[tokio::test]
async fn only_owner_or_admin_may_change_a_booking() {
    let f = Fixture::new("ownership.wal").await;
    let created = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let id = created.booking.id;

    let err = f
        .engine
        .update_booking(&f.luis, id, BookingPatch { attendees: Some(3), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert!(matches!(f.engine.delete_booking(&f.luis, id).await, Err(EngineError::Forbidden(_))));

    // Email match ignores case
    let shouting = RequestContext::new(Principal::new(ANA.to_uppercase(), Roles::single(Role::Profesor)));
    assert_ok!(
        f.engine
            .update_booking(&shouting, id, BookingPatch { attendees: Some(3), ..Default::default() })
            .await
    );

    let removed = assert_ok!(f.engine.delete_booking(&f.admin, id).await);
    assert_eq!(removed.id, id);
    assert!(matches!(
        f.engine.get_booking(&f.admin, id).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn route_policy() {
    let f = Fixture::new("route_policy.wal").await;

    assert!(matches!(
        f.engine.list_rooms(&anonymous(), RoomFilter::default()).await,
        Err(EngineError::Unauthenticated)
    ));
    assert_ok!(f.engine.list_rooms(&f.ana, RoomFilter::default()).await);
    assert!(matches!(
        f.engine
            .create_room(&f.ana, NewRoom { id: None, name: "X".into(), capacity: 1, has_computers: false })
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        f.engine.delete_time_slot(&f.ana, f.slots[0].id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        f.engine.create_booking(&anonymous(), f.booking(0, 1)).await,
        Err(EngineError::Unauthenticated)
    ));
}

// ── Cascades ─────────────────────────────────────────────

#[tokio::test]
async fn delete_room_cascades_to_its_bookings() {
    let f = Fixture::new("cascade_room.wal").await;
    let other = f.second_room().await;
    let a = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let b = f.engine.create_booking(&f.luis, f.booking(2, 2)).await.unwrap();
    let mut elsewhere = f.booking(0, 2);
    elsewhere.room_id = other.id;
    let kept = f.engine.create_booking(&f.ana, elsewhere).await.unwrap();

    let report = f.engine.delete_room(&f.admin, f.room.id).await.unwrap();
    assert_eq!(report.id, f.room.id);
    let mut removed = report.bookings.clone();
    removed.sort();
    let mut expected = vec![a.booking.id, b.booking.id];
    expected.sort();
    assert_eq!(removed, expected);

    assert!(matches!(
        f.engine.get_room(&f.admin, f.room.id).await,
        Err(EngineError::NotFound { entity: "room", .. })
    ));
    let remaining = f.engine.list_bookings(&f.admin).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].booking.id, kept.booking.id);
    assert_eq!(f.engine.store.booking_count(), 1);
}

#[tokio::test]
async fn delete_time_slot_cascades_across_rooms() {
    let f = Fixture::new("cascade_slot.wal").await;
    let other = f.second_room().await;
    f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let mut elsewhere = f.booking(0, 2);
    elsewhere.room_id = other.id;
    f.engine.create_booking(&f.luis, elsewhere).await.unwrap();
    let kept = f.engine.create_booking(&f.ana, f.booking(2, 2)).await.unwrap();

    let report = f.engine.delete_time_slot(&f.admin, f.slots[0].id).await.unwrap();
    assert_eq!(report.bookings.len(), 2);
    assert!(f.engine.get_time_slot(&f.admin, f.slots[0].id).await.is_err());

    let remaining = f.engine.list_bookings(&f.admin).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].booking.id, kept.booking.id);
}

#[tokio::test]
async fn delete_user_cascades_and_respects_ownership() {
    let f = Fixture::new("cascade_user.wal").await;
    f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    f.engine.create_booking(&f.ana, f.booking(2, 2)).await.unwrap();
    let luis_booking = {
        let mut input = f.booking(0, 2);
        input.date = input.date + Days::new(7);
        f.engine.create_booking(&f.luis, input).await.unwrap()
    };
    let ana_id = f.engine.profile(&f.ana).await.unwrap().id;

    assert!(matches!(
        f.engine.delete_user(&f.luis, ana_id).await,
        Err(EngineError::Forbidden(_))
    ));

    // Ana deletes her own account
    let report = f.engine.delete_user(&f.ana, ana_id).await.unwrap();
    assert_eq!(report.bookings.len(), 2);
    let remaining = f.engine.list_bookings(&f.admin).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].booking.id, luis_booking.booking.id);

    // Her login now degrades to anonymous
    assert!(!f.engine.resolve_principal(ANA).is_authenticated());
}

#[tokio::test]
async fn delete_missing_parent_is_not_found() {
    let f = Fixture::new("cascade_missing.wal").await;
    assert!(matches!(
        f.engine.delete_room(&f.admin, Ulid::new()).await,
        Err(EngineError::NotFound { entity: "room", .. })
    ));
    assert!(matches!(
        f.engine.delete_time_slot(&f.admin, Ulid::new()).await,
        Err(EngineError::NotFound { entity: "time slot", .. })
    ));
    assert!(matches!(
        f.engine.delete_user(&f.admin, Ulid::new()).await,
        Err(EngineError::NotFound { entity: "user", .. })
    ));
}

/// A writer that fails every append.
fn failing_wal() -> mpsc::Sender<WalCommand> {
    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WalCommand::Append { response, .. } | WalCommand::Compact { response, .. } => {
                    let _ = response.send(Err(io::Error::other("disk full")));
                }
                WalCommand::AppendsSinceCompact { response } => {
                    let _ = response.send(0);
                }
            }
        }
    });
    tx
}

#[tokio::test]
async fn failed_cascade_leaves_everything_in_place() {
    let path = test_wal_path("cascade_wal_failure.wal");
    let f = Fixture::new("cascade_wal_failure.wal").await;
    let booking = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let room_id = f.room.id;
    let (admin, ana) = (f.admin.clone(), f.ana.clone());

    let mut engine = Arc::try_unwrap(f.engine).ok().unwrap();
    engine.wal_tx = failing_wal();

    let err = engine.delete_room(&admin, room_id).await.unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)));
    assert!(engine.get_room(&admin, room_id).await.is_ok());
    assert_eq!(engine.get_booking(&ana, booking.booking.id).await.unwrap().room.id, room_id);

    // Nothing reached the log either
    drop(engine);
    let replayed = Engine::new(path).unwrap();
    assert!(replayed.store.contains_room(&room_id));
    assert_eq!(replayed.store.booking_count(), 1);
}

#[tokio::test]
async fn failed_time_slot_cascade_leaves_everything_in_place() {
    let path = test_wal_path("slot_cascade_wal_failure.wal");
    let f = Fixture::new("slot_cascade_wal_failure.wal").await;
    let other = f.second_room().await;
    f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let mut elsewhere = f.booking(0, 2);
    elsewhere.room_id = other.id;
    f.engine.create_booking(&f.luis, elsewhere).await.unwrap();
    let slot_id = f.slots[0].id;
    let admin = f.admin.clone();

    let mut engine = Arc::try_unwrap(f.engine).ok().unwrap();
    engine.wal_tx = failing_wal();

    let err = engine.delete_time_slot(&admin, slot_id).await.unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)));
    assert!(engine.store.contains_time_slot(&slot_id));
    assert_eq!(engine.store.booking_count(), 2);
    assert_eq!(engine.room_bookings(&admin, f.room.id).await.unwrap().len(), 1);
    assert_eq!(engine.room_bookings(&admin, other.id).await.unwrap().len(), 1);

    drop(engine);
    let replayed = Engine::new(path).unwrap();
    assert!(replayed.store.contains_time_slot(&slot_id));
    assert_eq!(replayed.store.booking_count(), 2);
}

#[tokio::test]
async fn failed_user_cascade_leaves_everything_in_place() {
    let path = test_wal_path("user_cascade_wal_failure.wal");
    let f = Fixture::new("user_cascade_wal_failure.wal").await;
    let booking = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
    let ana_id = f.engine.profile(&f.ana).await.unwrap().id;
    let (admin, ana) = (f.admin.clone(), f.ana.clone());

    let mut engine = Arc::try_unwrap(f.engine).ok().unwrap();
    engine.wal_tx = failing_wal();

    let err = engine.delete_user(&admin, ana_id).await.unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)));
    assert!(engine.store.contains_user(&ana_id));
    assert_eq!(engine.store.user_count(), 3);
    assert!(engine.resolve_principal(ANA).is_authenticated());
    assert_eq!(engine.get_booking(&ana, booking.booking.id).await.unwrap().creator.email, ANA);

    drop(engine);
    let replayed = Engine::new(path).unwrap();
    assert!(replayed.store.contains_user(&ana_id));
    assert_eq!(replayed.store.booking_count(), 1);
}

// ── Users ────────────────────────────────────────────────

#[tokio::test]
async fn first_user_may_bootstrap_admin_only_once() {
    let engine = Engine::new(test_wal_path("bootstrap.wal")).unwrap();
    assert_ok!(
        engine
            .register_user(&anonymous(), new_user("Root", ADMIN, Role::Admin))
            .await
    );
    let err = engine
        .register_user(&anonymous(), new_user("Eve", "eve@uni.example", Role::Admin))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let admin = ctx(&engine, ADMIN);
    assert_ok!(
        engine
            .register_user(&admin, new_user("Second", "second@uni.example", Role::Admin))
            .await
    );
}

#[tokio::test]
async fn registration_rejects_duplicate_email_ignoring_case() {
    let f = Fixture::new("dup_email.wal").await;
    let err = f
        .engine
        .register_user(&anonymous(), new_user("Ana Bis", &ANA.to_uppercase(), Role::Profesor))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "email", .. }));
}

#[tokio::test]
async fn registration_reports_first_bad_field() {
    let engine = Engine::new(test_wal_path("register_fields.wal")).unwrap();
    let mut input = new_user("Bea", "bea@uni.example", Role::Profesor);
    input.roles = Some(Roles::parse("ROLE_ADMIN,ROLE_PROFESOR"));
    input.password = Some("123".into());
    let err = engine.register_user(&anonymous(), input).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "role", .. }));

    let mut input = new_user("Bea", "bea@uni.example", Role::Profesor);
    input.password = Some("123".into());
    let err = engine.register_user(&anonymous(), input).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "password", .. }));
    assert_eq!(engine.store.user_count(), 0);
}

#[tokio::test]
async fn only_admin_changes_roles_or_status() {
    let f = Fixture::new("user_roles.wal").await;
    let ana_id = f.engine.profile(&f.ana).await.unwrap().id;

    let promote = UserPatch { roles: Some(Roles::single(Role::Admin)), ..Default::default() };
    assert!(matches!(
        f.engine.update_user(&f.ana, ana_id, promote.clone()).await,
        Err(EngineError::Forbidden(_))
    ));
    let renamed = f
        .engine
        .update_user(&f.ana, ana_id, UserPatch { name: Some("Ana María".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(renamed.name, "Ana María");
    assert_eq!(renamed.roles, Roles::single(Role::Profesor));

    let disable = UserPatch { enabled: Some(false), ..Default::default() };
    assert_ok!(f.engine.update_user(&f.admin, ana_id, disable).await);
    assert!(!f.engine.resolve_principal(ANA).is_authenticated());
    assert!(f.engine.credential_for(ANA).is_none());
}

#[tokio::test]
async fn change_password_replaces_credential() {
    let f = Fixture::new("change_password.wal").await;
    assert_eq!(f.engine.credential_for(ANA).as_deref(), Some("secret-1"));

    f.engine.change_password(&f.ana, "brand-new".into()).await.unwrap();
    assert_eq!(f.engine.credential_for(ANA).as_deref(), Some("brand-new"));

    let err = f.engine.change_password(&f.ana, "abc".into()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { field: "password", .. }));
    assert!(matches!(
        f.engine.change_password(&anonymous(), "whatever".into()).await,
        Err(EngineError::Unauthenticated)
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn room_filters_and_booking_details() {
    let f = Fixture::new("queries.wal").await;
    f.second_room().await;

    let with_computers = f
        .engine
        .list_rooms(&f.ana, RoomFilter { has_computers: Some(true), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(with_computers.len(), 1);
    let big = f
        .engine
        .list_rooms(&f.ana, RoomFilter { min_capacity: Some(11), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(big, vec![f.room.clone()]);

    let created = f.engine.create_booking(&f.ana, f.booking(0, 3)).await.unwrap();
    let detail = f.engine.get_booking(&f.luis, created.booking.id).await.unwrap();
    assert_eq!(detail.room, f.room);
    assert_eq!(detail.time_slot, f.slots[0]);
    assert_eq!(detail.creator.email, ANA);

    let slots = f.engine.list_time_slots(&f.ana).await.unwrap();
    let starts: Vec<NaiveTime> = slots.iter().map(|s| s.start).collect();
    assert_eq!(starts, vec![t(8, 0), t(9, 0), t(10, 0)]);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state_after_cascade() {
    let path = test_wal_path("replay.wal");
    let (room_id, kept_id) = {
        let f = Fixture::open(Engine::new(path.clone()).unwrap()).await;
        let other = f.second_room().await;
        f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
        let mut moved = f.booking(2, 2);
        moved.room_id = other.id;
        let kept = f.engine.create_booking(&f.luis, moved).await.unwrap();
        f.engine
            .update_booking(&f.luis, kept.booking.id, BookingPatch { attendees: Some(7), ..Default::default() })
            .await
            .unwrap();
        f.engine.delete_room(&f.admin, f.room.id).await.unwrap();
        (f.room.id, kept.booking.id)
    };

    let engine = Engine::new(path).unwrap();
    let admin = ctx(&engine, ADMIN);
    assert!(!engine.store.contains_room(&room_id));
    assert_eq!(engine.store.user_count(), 3);
    assert_eq!(engine.store.time_slot_count(), 3);
    let bookings = engine.list_bookings(&admin).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].booking.id, kept_id);
    assert_eq!(bookings[0].booking.attendees, 7);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let before = {
        let f = Fixture::open(Engine::new(path.clone()).unwrap()).await;
        let created = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap();
        f.engine
            .update_room(&f.admin, f.room.id, RoomPatch { name: Some("Aula Magna".into()), ..Default::default() })
            .await
            .unwrap();
        f.engine.create_booking(&f.ana, f.booking(2, 2)).await.unwrap();
        f.engine.delete_booking(&f.ana, created.booking.id).await.unwrap();

        assert!(f.engine.wal_appends_since_compact().await > 0);
        f.engine.compact_wal().await.unwrap();
        assert_eq!(f.engine.wal_appends_since_compact().await, 0);
        f.engine.list_bookings(&f.admin).await.unwrap()
    };

    // 3 users + 3 slots + 1 room + 1 booking
    assert_eq!(crate::wal::Wal::replay(&path).unwrap().len(), 8);

    let engine = Engine::new(path).unwrap();
    let after = engine.list_bookings(&ctx(&engine, ADMIN)).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after[0].room.name, "Aula Magna");
}

#[tokio::test]
async fn commits_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail_restart.wal");
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .register_user(&anonymous(), new_user("Admin", ADMIN, Role::Admin))
            .await
            .unwrap();
    }
    // Crash mid-append: a length prefix and a few payload bytes
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[40, 0, 0, 0, 9, 9, 9]).unwrap();
    }

    let room_id = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_eq!(engine.store.user_count(), 1);
        let admin = ctx(&engine, ADMIN);
        engine
            .create_room(&admin, NewRoom { id: None, name: "Aula 7".into(), capacity: 12, has_computers: false })
            .await
            .unwrap()
            .id
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.store.user_count(), 1);
    assert!(engine.store.contains_room(&room_id));
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit.wal");
    let f = Fixture::open(Engine::new(path.clone()).unwrap()).await;

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = f.engine.clone();
        let admin = f.admin.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_room(&admin, NewRoom { id: None, name: format!("R{i}"), capacity: 5, has_computers: false })
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(f.engine.store.room_count(), n + 1);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.store.room_count(), n + 1);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_conflicting_bookings_admit_exactly_one() {
    let f = Fixture::new("race.wal").await;

    let mut handles = Vec::new();
    for (ctx, slot) in [(f.ana.clone(), 0), (f.luis.clone(), 1), (f.ana.clone(), 0), (f.luis.clone(), 1)] {
        let engine = f.engine.clone();
        let input = f.booking(slot, 2);
        handles.push(tokio::spawn(async move { engine.create_booking(&ctx, input).await }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Overlap(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(f.engine.list_bookings(&f.admin).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_request_commits_nothing() {
    let f = Fixture::new("cancelled.wal").await;
    let token = CancellationToken::new();
    let ctx = RequestContext::with_cancel(f.ana.principal().clone(), token.clone());
    token.cancel();

    let err = f.engine.create_booking(&ctx, f.booking(0, 2)).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert!(f.engine.list_bookings(&f.admin).await.unwrap().is_empty());
}

#[tokio::test]
async fn lock_wait_is_bounded() {
    let engine = Engine::with_lock_timeout(test_wal_path("lock_timeout.wal"), Duration::from_millis(50)).unwrap();
    let f = Fixture::open(engine).await;

    let held = f.engine.begin_exclusive().await.unwrap();
    let err = f.engine.create_booking(&f.ana, f.booking(0, 2)).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
    drop(held);

    assert_ok!(f.engine.create_booking(&f.ana, f.booking(0, 2)).await);
}

#[tokio::test]
async fn deleted_room_is_retired_and_cannot_be_locked() {
    let f = Fixture::new("retired.wal").await;
    let handle = f.engine.store.get_room(&f.room.id).unwrap();
    f.engine.delete_room(&f.admin, f.room.id).await.unwrap();
    assert!(handle.read().await.retired);

    let mut txn = f.engine.begin().await.unwrap();
    assert!(matches!(
        f.engine.lock_rooms(&mut txn, &[f.room.id]).await,
        Err(EngineError::NotFound { entity: "room", .. })
    ));
}
