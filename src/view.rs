//! JSON shapes returned to clients. Field names follow the public API, which is in Spanish.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub id: Ulid,
    pub nombre: String,
    pub capacidad: u32,
    pub es_ordenadores: bool,
}

impl From<&Room> for RoomView {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            nombre: room.name.clone(),
            capacidad: room.capacity,
            es_ordenadores: room.has_computers,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlotView {
    pub id: Ulid,
    pub dia_semana: &'static str,
    pub hora_inicio: NaiveTime,
    pub hora_fin: NaiveTime,
}

impl From<&TimeSlot> for TimeSlotView {
    fn from(slot: &TimeSlot) -> Self {
        Self {
            id: slot.id,
            dia_semana: slot.day.as_str(),
            hora_inicio: slot.start,
            hora_fin: slot.end,
        }
    }
}

/// Public profile. The password never leaves the engine.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: Ulid,
    pub nombre: String,
    pub rol: String,
    pub email: String,
    pub enabled: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            nombre: user.name.clone(),
            rol: user.roles.to_string(),
            email: user.email.clone(),
            enabled: user.enabled,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub id: Ulid,
    pub fecha: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motivo: Option<String>,
    pub asistentes: u32,
    pub fecha_creacion: DateTime<Utc>,
    pub aula: RoomView,
    pub horario: TimeSlotView,
    pub creado_por: UserView,
}

impl From<&BookingDetail> for BookingView {
    fn from(detail: &BookingDetail) -> Self {
        let b = &detail.booking;
        Self {
            id: b.id,
            fecha: b.date,
            motivo: b.reason.clone(),
            asistentes: b.attendees,
            fecha_creacion: b.created_at,
            aula: (&detail.room).into(),
            horario: (&detail.time_slot).into(),
            creado_por: (&detail.creator).into(),
        }
    }
}

pub fn to_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}
