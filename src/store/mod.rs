mod error;
mod pool;
mod sqlite;

pub use error::StoreError;
pub use pool::{StoreLease, StorePool};
pub use sqlite::Store;

use chrono::Local;

use crate::wire::message::{TicketType, VehicleType};

/// Persisted timestamps use local time in this fixed format.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub urn: String,
    pub name: String,
    pub age: i32,
    pub registration_date: String,
    pub active: bool,
    pub pin_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub group_id: i64,
    pub group_name: String,
    pub leader_urn: String,
    pub creation_date: String,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vehicle {
    pub uri: String,
    pub vehicle_type: VehicleType,
    pub capacity: i32,
    pub available_seats: i32,
    pub route: String,
    pub active: bool,
    pub last_update: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ticket {
    pub ticket_id: String,
    pub user_urn: String,
    pub ticket_type: TicketType,
    pub vehicle_type: VehicleType,
    pub route: String,
    pub price: f64,
    pub discount: f64,
    pub purchase_date: String,
    pub seat_number: String,
    pub used: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Payment {
    pub transaction_id: String,
    pub ticket_id: Option<String>,
    pub amount: f64,
    pub payment_method: String,
    pub payment_date: String,
    pub successful: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PriceEntry {
    pub vehicle_type: VehicleType,
    pub ticket_type: TicketType,
    pub base_price: f64,
    pub distance_multiplier: f64,
    pub time_multiplier: f64,
    pub last_update: String,
}
