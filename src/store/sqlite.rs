use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::wire::message::{TicketType, VehicleType};

use super::{
    local_timestamp, Group, Payment, PriceEntry, StoreError, Ticket, User, Vehicle,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSACTION_ATTEMPTS: u32 = 4;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    urn TEXT PRIMARY KEY,
    name TEXT,
    age INTEGER,
    registration_date TEXT,
    active BOOLEAN,
    pin_hash TEXT
);
CREATE TABLE IF NOT EXISTS groups (
    group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name TEXT UNIQUE,
    leader_urn TEXT,
    creation_date TEXT,
    active BOOLEAN,
    FOREIGN KEY (leader_urn) REFERENCES users(urn)
);
CREATE TABLE IF NOT EXISTS group_members (
    group_id INTEGER,
    member_urn TEXT,
    join_date TEXT,
    active BOOLEAN,
    PRIMARY KEY (group_id, member_urn),
    FOREIGN KEY (group_id) REFERENCES groups(group_id) ON DELETE CASCADE,
    FOREIGN KEY (member_urn) REFERENCES users(urn)
);
CREATE TABLE IF NOT EXISTS vehicles (
    uri TEXT PRIMARY KEY,
    type INTEGER,
    capacity INTEGER,
    available_seats INTEGER,
    route TEXT,
    active BOOLEAN,
    last_update TEXT
);
CREATE TABLE IF NOT EXISTS tickets (
    ticket_id TEXT PRIMARY KEY,
    user_urn TEXT,
    type INTEGER,
    vehicle_type INTEGER,
    route TEXT,
    price REAL,
    discount REAL,
    purchase_date TEXT,
    seat_number TEXT,
    used BOOLEAN,
    FOREIGN KEY (user_urn) REFERENCES users(urn)
);
CREATE TABLE IF NOT EXISTS payments (
    transaction_id TEXT PRIMARY KEY,
    ticket_id TEXT,
    amount REAL,
    payment_method TEXT,
    payment_date TEXT,
    successful BOOLEAN,
    FOREIGN KEY (ticket_id) REFERENCES tickets(ticket_id)
);
CREATE TABLE IF NOT EXISTS price_list (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vehicle_type INTEGER,
    ticket_type INTEGER,
    base_price REAL,
    distance_multiplier REAL,
    time_multiplier REAL,
    last_update TEXT
);
CREATE TABLE IF NOT EXISTS active_connections (
    connection_id TEXT PRIMARY KEY,
    client_address TEXT,
    client_port INTEGER,
    user_urn TEXT,
    connect_time TEXT,
    last_activity TEXT,
    authenticated BOOLEAN,
    FOREIGN KEY (user_urn) REFERENCES users(urn)
);
";

/// One handle onto the relational store. Handles are leased exclusively from
/// the pool, so operations take `&self` without further locking.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(|source| StoreError::Open {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row, so it cannot go through execute
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn })
    }

    // ----- transactions -----

    pub fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    /// Runs `op` inside BEGIN IMMEDIATE/COMMIT, rolling back on error and
    /// retrying the whole unit a bounded number of times when the store
    /// reports busy.
    pub fn in_transaction<T>(
        &self,
        mut op: impl FnMut(&Store) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_transaction(&mut op) {
                Err(error) if error.is_busy() && attempt < TRANSACTION_ATTEMPTS => {
                    std::thread::sleep(Duration::from_millis(10_u64 << attempt));
                }
                result => return result,
            }
        }
    }

    fn try_transaction<T>(
        &self,
        op: &mut impl FnMut(&Store) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.begin()?;
        match op(self) {
            Ok(value) => match self.commit() {
                Ok(()) => Ok(value),
                Err(error) => {
                    let _ = self.rollback();
                    Err(error)
                }
            },
            Err(error) => {
                let _ = self.rollback();
                Err(error)
            }
        }
    }

    // ----- users -----

    pub fn register_user(&self, user: &User) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO users (urn, name, age, registration_date, active, pin_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.urn,
                    user.name,
                    user.age,
                    user.registration_date,
                    user.active,
                    user.pin_hash
                ],
            )
            .map_err(|source| match StoreError::from_sqlite(source) {
                StoreError::Constraint { .. } => StoreError::constraint("User already registered"),
                other => other,
            })?;
        Ok(())
    }

    pub fn get_user(&self, urn: &str) -> Result<Option<User>, StoreError> {
        let user = self
            .conn
            .query_row(
                "SELECT urn, name, age, registration_date, active, pin_hash \
                 FROM users WHERE urn = ?1",
                params![urn],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_all_users(&self) -> Result<Vec<User>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT urn, name, age, registration_date, active, pin_hash FROM users",
        )?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let changes = self.conn.execute(
            "UPDATE users SET name = ?1, age = ?2, registration_date = ?3, active = ?4, \
             pin_hash = ?5 WHERE urn = ?6",
            params![
                user.name,
                user.age,
                user.registration_date,
                user.active,
                user.pin_hash,
                user.urn
            ],
        )?;
        if changes == 0 {
            return Err(StoreError::not_found("User not found"));
        }
        Ok(())
    }

    pub fn delete_user(&self, urn: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM users WHERE urn = ?1", params![urn])?;
        Ok(())
    }

    pub fn authenticate_user(&self, urn: &str, pin: &str) -> Result<bool, StoreError> {
        let Some(user) = self.get_user(urn)? else {
            return Ok(false);
        };
        Ok(hash_pin(pin) == user.pin_hash)
    }

    // ----- groups -----

    /// Creates the group and inserts the leader into the membership set in
    /// the same step. Returns the assigned group id.
    pub fn create_group(
        &self,
        group_name: &str,
        leader_urn: &str,
        creation_date: &str,
    ) -> Result<i64, StoreError> {
        let creation = if creation_date.is_empty() {
            local_timestamp()
        } else {
            creation_date.to_owned()
        };

        self.conn
            .execute(
                "INSERT INTO groups (group_name, leader_urn, creation_date, active) \
                 VALUES (?1, ?2, ?3, 1)",
                params![group_name, leader_urn, creation],
            )
            .map_err(|source| match StoreError::from_sqlite(source) {
                StoreError::Constraint { .. } => {
                    StoreError::constraint("Group name already taken")
                }
                other => other,
            })?;
        let group_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "INSERT OR REPLACE INTO group_members (group_id, member_urn, join_date, active) \
             VALUES (?1, ?2, ?3, 1)",
            params![group_id, leader_urn, local_timestamp()],
        )?;

        Ok(group_id)
    }

    pub fn get_group(&self, group_name: &str) -> Result<Option<Group>, StoreError> {
        let group = self
            .conn
            .query_row(
                "SELECT group_id, group_name, leader_urn, creation_date, active \
                 FROM groups WHERE group_name = ?1 AND active = 1 LIMIT 1",
                params![group_name],
                |row| {
                    Ok(Group {
                        group_id: row.get(0)?,
                        group_name: row.get(1)?,
                        leader_urn: row.get(2)?,
                        creation_date: row.get(3)?,
                        active: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(group)
    }

    pub fn get_group_leader(&self, group_name: &str) -> Result<Option<String>, StoreError> {
        let leader = self
            .conn
            .query_row(
                "SELECT leader_urn FROM groups WHERE group_name = ?1 AND active = 1 LIMIT 1",
                params![group_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(leader)
    }

    /// Membership insert rules: an active duplicate is rejected, an inactive
    /// historical row is reactivated with a fresh join date.
    pub fn add_user_to_group(&self, urn: &str, group_name: &str) -> Result<(), StoreError> {
        if self.get_user(urn)?.is_none() {
            return Err(StoreError::not_found("User not found"));
        }
        let group_id = self
            .group_id_by_name(group_name)?
            .ok_or_else(|| StoreError::not_found("Group not found"))?;

        let existing: Option<bool> = self
            .conn
            .query_row(
                "SELECT active FROM group_members WHERE group_id = ?1 AND member_urn = ?2 LIMIT 1",
                params![group_id, urn],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(true) => Err(StoreError::constraint("User already in group")),
            Some(false) => {
                self.conn.execute(
                    "UPDATE group_members SET active = 1, join_date = ?1 \
                     WHERE group_id = ?2 AND member_urn = ?3",
                    params![local_timestamp(), group_id, urn],
                )?;
                Ok(())
            }
            None => {
                self.conn.execute(
                    "INSERT INTO group_members (group_id, member_urn, join_date, active) \
                     VALUES (?1, ?2, ?3, 1)",
                    params![group_id, urn, local_timestamp()],
                )?;
                Ok(())
            }
        }
    }

    pub fn remove_user_from_group(&self, urn: &str, group_name: &str) -> Result<(), StoreError> {
        let group_id = self
            .group_id_by_name(group_name)?
            .ok_or_else(|| StoreError::not_found("Group not found"))?;

        let changes = self.conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND member_urn = ?2",
            params![group_id, urn],
        )?;
        if changes == 0 {
            return Err(StoreError::not_found("User not in group"));
        }
        Ok(())
    }

    /// Active flag of a membership row, or `None` when no row exists.
    pub fn group_member_active(
        &self,
        group_name: &str,
        urn: &str,
    ) -> Result<Option<bool>, StoreError> {
        let Some(group_id) = self.group_id_by_name(group_name)? else {
            return Ok(None);
        };
        let active = self
            .conn
            .query_row(
                "SELECT active FROM group_members WHERE group_id = ?1 AND member_urn = ?2 LIMIT 1",
                params![group_id, urn],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active)
    }

    fn group_id_by_name(&self, group_name: &str) -> Result<Option<i64>, StoreError> {
        let group_id = self
            .conn
            .query_row(
                "SELECT group_id FROM groups WHERE group_name = ?1 AND active = 1 LIMIT 1",
                params![group_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(group_id)
    }

    // ----- vehicles -----

    pub fn register_vehicle(&self, vehicle: &Vehicle) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO vehicles \
             (uri, type, capacity, available_seats, route, active, last_update) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                vehicle.uri,
                vehicle.vehicle_type.code(),
                vehicle.capacity,
                vehicle.available_seats,
                vehicle.route,
                vehicle.active,
                vehicle.last_update
            ],
        )?;
        Ok(())
    }

    pub fn get_vehicle(&self, uri: &str) -> Result<Option<Vehicle>, StoreError> {
        let vehicle = self
            .conn
            .query_row(
                "SELECT uri, type, capacity, available_seats, route, active, last_update \
                 FROM vehicles WHERE uri = ?1 LIMIT 1",
                params![uri],
                row_to_vehicle,
            )
            .optional()?;
        Ok(vehicle)
    }

    pub fn get_vehicle_by_route_and_type(
        &self,
        route: &str,
        vehicle_type: VehicleType,
    ) -> Result<Option<Vehicle>, StoreError> {
        let vehicle = self
            .conn
            .query_row(
                "SELECT uri, type, capacity, available_seats, route, active, last_update \
                 FROM vehicles WHERE route = ?1 AND type = ?2 LIMIT 1",
                params![route, vehicle_type.code()],
                row_to_vehicle,
            )
            .optional()?;
        Ok(vehicle)
    }

    pub fn get_all_vehicles(&self) -> Result<Vec<Vehicle>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT uri, type, capacity, available_seats, route, active, last_update \
             FROM vehicles",
        )?;
        let vehicles = stmt
            .query_map([], row_to_vehicle)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vehicles)
    }

    pub fn update_seat_availability(
        &self,
        uri: &str,
        available_seats: i32,
    ) -> Result<(), StoreError> {
        let changes = self.conn.execute(
            "UPDATE vehicles SET available_seats = ?1 WHERE uri = ?2",
            params![available_seats, uri],
        )?;
        if changes == 0 {
            return Err(StoreError::not_found("Vehicle not found"));
        }
        Ok(())
    }

    /// Updates any subset of {active, route, type}; at least one must be set.
    pub fn update_vehicle_fields(
        &self,
        uri: &str,
        active: Option<bool>,
        route: Option<&str>,
        vehicle_type: Option<VehicleType>,
    ) -> Result<(), StoreError> {
        if uri.is_empty() {
            return Err(StoreError::misuse("Empty URI"));
        }
        if active.is_none() && route.is_none() && vehicle_type.is_none() {
            return Err(StoreError::misuse("Nothing to update"));
        }

        let mut assignments = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(active) = active {
            assignments.push("active = ?");
            values.push(Box::new(active));
        }
        if let Some(route) = route {
            assignments.push("route = ?");
            values.push(Box::new(route.to_owned()));
        }
        if let Some(vehicle_type) = vehicle_type {
            assignments.push("type = ?");
            values.push(Box::new(vehicle_type.code()));
        }
        assignments.push("last_update = ?");
        values.push(Box::new(local_timestamp()));
        values.push(Box::new(uri.to_owned()));

        let sql = format!(
            "UPDATE vehicles SET {} WHERE uri = ?",
            assignments.join(", ")
        );
        let changes = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        if changes == 0 {
            return Err(StoreError::not_found("Vehicle not found"));
        }
        Ok(())
    }

    pub fn update_vehicle_capacity(
        &self,
        uri: &str,
        capacity: i32,
        available_seats: i32,
    ) -> Result<(), StoreError> {
        if uri.is_empty() {
            return Err(StoreError::misuse("Empty URI"));
        }
        if capacity < 0 || available_seats < 0 || available_seats > capacity {
            return Err(StoreError::misuse("Invalid capacity/available_seats"));
        }

        let changes = self.conn.execute(
            "UPDATE vehicles SET capacity = ?1, available_seats = ?2, last_update = ?3 \
             WHERE uri = ?4",
            params![capacity, available_seats, local_timestamp(), uri],
        )?;
        if changes == 0 {
            return Err(StoreError::not_found("Vehicle not found"));
        }
        Ok(())
    }

    // ----- tickets -----

    pub fn create_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO tickets (ticket_id, user_urn, type, vehicle_type, route, price, \
             discount, purchase_date, seat_number, used) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ticket.ticket_id,
                ticket.user_urn,
                ticket.ticket_type.code(),
                ticket.vehicle_type.code(),
                ticket.route,
                ticket.price,
                ticket.discount,
                ticket.purchase_date,
                ticket.seat_number,
                ticket.used
            ],
        )?;
        Ok(())
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        let ticket = self
            .conn
            .query_row(
                "SELECT ticket_id, user_urn, type, vehicle_type, route, price, discount, \
                 purchase_date, seat_number, used FROM tickets WHERE ticket_id = ?1",
                params![ticket_id],
                row_to_ticket,
            )
            .optional()?;
        Ok(ticket)
    }

    pub fn get_user_tickets(&self, urn: &str) -> Result<Vec<Ticket>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ticket_id, user_urn, type, vehicle_type, route, price, discount, \
             purchase_date, seat_number, used FROM tickets WHERE user_urn = ?1",
        )?;
        let tickets = stmt
            .query_map(params![urn], row_to_ticket)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    // ----- payments -----

    pub fn record_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO payments (transaction_id, ticket_id, amount, payment_method, \
             payment_date, successful) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                payment.transaction_id,
                payment.ticket_id,
                payment.amount,
                payment.payment_method,
                payment.payment_date,
                payment.successful
            ],
        )?;
        Ok(())
    }

    pub fn get_payment(&self, transaction_id: &str) -> Result<Option<Payment>, StoreError> {
        let payment = self
            .conn
            .query_row(
                "SELECT transaction_id, ticket_id, amount, payment_method, payment_date, \
                 successful FROM payments WHERE transaction_id = ?1",
                params![transaction_id],
                row_to_payment,
            )
            .optional()?;
        Ok(payment)
    }

    pub fn get_ticket_payments(&self, ticket_id: &str) -> Result<Vec<Payment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, ticket_id, amount, payment_method, payment_date, \
             successful FROM payments WHERE ticket_id = ?1",
        )?;
        let payments = stmt
            .query_map(params![ticket_id], row_to_payment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    // ----- prices -----

    /// Upserts the base price for a (vehicle, ticket) pair; a fresh row gets
    /// neutral multipliers.
    pub fn update_price(
        &self,
        vehicle_type: VehicleType,
        ticket_type: TicketType,
        price: f64,
    ) -> Result<(), StoreError> {
        let timestamp = local_timestamp();
        let changes = self.conn.execute(
            "UPDATE price_list SET base_price = ?1, last_update = ?2 \
             WHERE vehicle_type = ?3 AND ticket_type = ?4",
            params![price, timestamp, vehicle_type.code(), ticket_type.code()],
        )?;
        if changes > 0 {
            return Ok(());
        }

        self.conn.execute(
            "INSERT INTO price_list \
             (vehicle_type, ticket_type, base_price, distance_multiplier, time_multiplier, \
             last_update) VALUES (?1, ?2, ?3, 1.0, 1.0, ?4)",
            params![vehicle_type.code(), ticket_type.code(), price, timestamp],
        )?;
        Ok(())
    }

    pub fn get_price(
        &self,
        vehicle_type: VehicleType,
        ticket_type: TicketType,
    ) -> Result<Option<PriceEntry>, StoreError> {
        let price = self
            .conn
            .query_row(
                "SELECT vehicle_type, ticket_type, base_price, distance_multiplier, \
                 time_multiplier, last_update FROM price_list \
                 WHERE vehicle_type = ?1 AND ticket_type = ?2 LIMIT 1",
                params![vehicle_type.code(), ticket_type.code()],
                |row| {
                    Ok(PriceEntry {
                        vehicle_type: vehicle_type_column(row, 0)?,
                        ticket_type: ticket_type_column(row, 1)?,
                        base_price: row.get(2)?,
                        distance_multiplier: row.get(3)?,
                        time_multiplier: row.get(4)?,
                        last_update: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(price)
    }

    /// Placeholder pricing: flat 1.0 per ticket. The price_list table is
    /// maintained by UPDATE_PRICE but the purchase flow does not consult it.
    /// TODO: fold price_list base prices in once the admin tooling seeds
    /// every (vehicle_type, ticket_type) pair.
    pub fn calculate_ticket_price(
        &self,
        _vehicle_type: VehicleType,
        _ticket_type: TicketType,
        _passengers: i32,
        _distance: f64,
        _time_minutes: f64,
    ) -> f64 {
        1.0
    }

    /// Discount policy: 10% for the family package or for groups of three
    /// or more.
    pub fn calculate_discount(&self, ticket_type: TicketType, group_size: i32) -> f64 {
        if ticket_type == TicketType::GroupFamily || group_size >= 3 {
            0.10
        } else {
            0.0
        }
    }
}

pub fn hash_pin(pin: &str) -> String {
    let mut hasher = DefaultHasher::new();
    pin.hash(&mut hasher);
    "salt".hash(&mut hasher);
    hasher.finish().to_string()
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        urn: row.get(0)?,
        name: row.get(1)?,
        age: row.get(2)?,
        registration_date: row.get(3)?,
        active: row.get(4)?,
        pin_hash: row.get(5)?,
    })
}

fn row_to_vehicle(row: &Row<'_>) -> rusqlite::Result<Vehicle> {
    Ok(Vehicle {
        uri: row.get(0)?,
        vehicle_type: vehicle_type_column(row, 1)?,
        capacity: row.get(2)?,
        available_seats: row.get(3)?,
        route: row.get(4)?,
        active: row.get(5)?,
        last_update: row.get(6)?,
    })
}

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        ticket_id: row.get(0)?,
        user_urn: row.get(1)?,
        ticket_type: ticket_type_column(row, 2)?,
        vehicle_type: vehicle_type_column(row, 3)?,
        route: row.get(4)?,
        price: row.get(5)?,
        discount: row.get(6)?,
        purchase_date: row.get(7)?,
        seat_number: row.get(8)?,
        used: row.get(9)?,
    })
}

fn row_to_payment(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        transaction_id: row.get(0)?,
        ticket_id: row.get(1)?,
        amount: row.get(2)?,
        payment_method: row.get(3)?,
        payment_date: row.get(4)?,
        successful: row.get(5)?,
    })
}

fn vehicle_type_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<VehicleType> {
    let code: i64 = row.get(idx)?;
    VehicleType::from_code(code as i32).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("unknown vehicle type code {code}").into(),
        )
    })
}

fn ticket_type_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<TicketType> {
    let code: i64 = row.get(idx)?;
    TicketType::from_code(code as i32).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("unknown ticket type code {code}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use crate::store::{local_timestamp, Payment, StoreError, Ticket, User, Vehicle};
    use crate::wire::message::{TicketType, VehicleType};

    use super::{hash_pin, Store};

    struct TempStore {
        store: Store,
        dir: PathBuf,
    }

    impl TempStore {
        fn new(suffix: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "faregate-store-test-{suffix}-{}",
                std::process::id()
            ));
            fs::create_dir_all(&dir).expect("temp store dir should create");
            let store = Store::open(dir.join("store.db")).expect("store should open");
            Self { store, dir }
        }
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn sample_user(urn: &str) -> User {
        User {
            urn: urn.to_owned(),
            name: format!("User_{urn}"),
            age: 25,
            registration_date: local_timestamp(),
            active: true,
            pin_hash: hash_pin("1234"),
        }
    }

    fn sample_vehicle(uri: &str, available: i32) -> Vehicle {
        Vehicle {
            uri: uri.to_owned(),
            vehicle_type: VehicleType::Bus,
            capacity: 50,
            available_seats: available,
            route: format!("Route_{uri}"),
            active: true,
            last_update: local_timestamp(),
        }
    }

    #[test]
    fn user_round_trip_and_duplicate_rejection() {
        let fixture = TempStore::new("users");
        let store = &fixture.store;

        let user = sample_user("1234567890123");
        store.register_user(&user).expect("first insert should work");
        let loaded = store
            .get_user("1234567890123")
            .expect("lookup should work")
            .expect("user should exist");
        assert_eq!(loaded, user);

        let error = store
            .register_user(&user)
            .expect_err("duplicate urn should fail");
        assert!(matches!(error, StoreError::Constraint { .. }));

        store
            .register_user(&sample_user("9999999999999"))
            .expect("second user should register");
        assert_eq!(store.get_all_users().expect("listing should work").len(), 2);
    }

    #[test]
    fn update_user_requires_existing_row() {
        let fixture = TempStore::new("user-update");
        let store = &fixture.store;

        let mut user = sample_user("1111111111111");
        let error = store.update_user(&user).expect_err("missing user");
        assert!(matches!(error, StoreError::NotFound { .. }));

        store.register_user(&user).expect("insert should work");
        user.name = "Renamed".to_owned();
        user.active = false;
        store.update_user(&user).expect("update should work");

        let loaded = store
            .get_user(&user.urn)
            .expect("lookup should work")
            .expect("user should exist");
        assert_eq!(loaded.name, "Renamed");
        assert!(!loaded.active);
    }

    #[test]
    fn pin_authentication_compares_hashes() {
        let fixture = TempStore::new("auth");
        let store = &fixture.store;
        store
            .register_user(&sample_user("2222222222222"))
            .expect("insert should work");

        assert!(store
            .authenticate_user("2222222222222", "1234")
            .expect("auth check should work"));
        assert!(!store
            .authenticate_user("2222222222222", "9999")
            .expect("auth check should work"));
        assert!(!store
            .authenticate_user("0000000000000", "1234")
            .expect("auth check should work"));
    }

    #[test]
    fn group_creation_inserts_leader_membership() {
        let fixture = TempStore::new("groups");
        let store = &fixture.store;
        store
            .register_user(&sample_user("1000000000001"))
            .expect("leader should register");

        let group_id = store
            .create_group("TEAM1", "1000000000001", "")
            .expect("group should create");
        assert!(group_id > 0);

        let group = store
            .get_group("TEAM1")
            .expect("group lookup should work")
            .expect("group should exist");
        assert_eq!(group.group_id, group_id);
        assert!(group.active);
        assert_eq!(
            store
                .get_group_leader("TEAM1")
                .expect("leader lookup should work"),
            Some("1000000000001".to_owned())
        );
        assert_eq!(
            store
                .group_member_active("TEAM1", "1000000000001")
                .expect("membership lookup should work"),
            Some(true)
        );

        let error = store
            .create_group("TEAM1", "1000000000001", "")
            .expect_err("duplicate name should fail");
        assert!(matches!(error, StoreError::Constraint { .. }));
    }

    #[test]
    fn membership_rules_duplicate_reactivate_remove() {
        let fixture = TempStore::new("membership");
        let store = &fixture.store;
        store
            .register_user(&sample_user("1000000000001"))
            .expect("leader should register");
        store
            .register_user(&sample_user("1000000000002"))
            .expect("member should register");
        store
            .create_group("TEAM1", "1000000000001", "")
            .expect("group should create");

        store
            .add_user_to_group("1000000000002", "TEAM1")
            .expect("first add should work");
        let duplicate = store
            .add_user_to_group("1000000000002", "TEAM1")
            .expect_err("active duplicate should fail");
        assert!(matches!(duplicate, StoreError::Constraint { .. }));

        // Historical inactive row reactivates with a fresh join date.
        fixture
            .store
            .conn
            .execute(
                "UPDATE group_members SET active = 0, join_date = 'then' \
                 WHERE member_urn = '1000000000002'",
                [],
            )
            .expect("deactivation should work");
        store
            .add_user_to_group("1000000000002", "TEAM1")
            .expect("reactivation should work");
        assert_eq!(
            store
                .group_member_active("TEAM1", "1000000000002")
                .expect("membership lookup should work"),
            Some(true)
        );

        store
            .remove_user_from_group("1000000000002", "TEAM1")
            .expect("removal should work");
        let missing = store
            .remove_user_from_group("1000000000002", "TEAM1")
            .expect_err("second removal should fail");
        assert!(matches!(missing, StoreError::NotFound { .. }));

        let no_group = store
            .add_user_to_group("1000000000002", "NO_SUCH_GROUP")
            .expect_err("unknown group should fail");
        assert!(matches!(no_group, StoreError::NotFound { .. }));
    }

    #[test]
    fn vehicle_round_trip_and_lookups() {
        let fixture = TempStore::new("vehicles");
        let store = &fixture.store;

        let vehicle = sample_vehicle("bus001", 50);
        store
            .register_vehicle(&vehicle)
            .expect("vehicle should register");
        assert_eq!(
            store
                .get_vehicle("bus001")
                .expect("lookup should work")
                .expect("vehicle should exist"),
            vehicle
        );
        assert_eq!(
            store
                .get_vehicle_by_route_and_type("Route_bus001", VehicleType::Bus)
                .expect("route lookup should work")
                .expect("vehicle should match"),
            vehicle
        );
        assert!(store
            .get_vehicle_by_route_and_type("Route_bus001", VehicleType::Tram)
            .expect("route lookup should work")
            .is_none());

        // register is an upsert, so re-registering replaces the row
        let replacement = sample_vehicle("bus001", 10);
        store
            .register_vehicle(&replacement)
            .expect("upsert should work");
        assert_eq!(
            store
                .get_vehicle("bus001")
                .expect("lookup should work")
                .expect("vehicle should exist")
                .available_seats,
            10
        );
        assert_eq!(
            store.get_all_vehicles().expect("listing should work").len(),
            1
        );
    }

    #[test]
    fn seat_availability_updates_require_known_vehicle() {
        let fixture = TempStore::new("seats");
        let store = &fixture.store;
        store
            .register_vehicle(&sample_vehicle("tram01", 30))
            .expect("vehicle should register");

        store
            .update_seat_availability("tram01", 29)
            .expect("update should work");
        assert_eq!(
            store
                .get_vehicle("tram01")
                .expect("lookup should work")
                .expect("vehicle should exist")
                .available_seats,
            29
        );

        let missing = store
            .update_seat_availability("ghost", 5)
            .expect_err("unknown vehicle should fail");
        assert!(matches!(missing, StoreError::NotFound { .. }));
    }

    #[test]
    fn vehicle_field_updates_validate_input() {
        let fixture = TempStore::new("vehicle-fields");
        let store = &fixture.store;
        store
            .register_vehicle(&sample_vehicle("bus002", 50))
            .expect("vehicle should register");

        let nothing = store
            .update_vehicle_fields("bus002", None, None, None)
            .expect_err("empty update should fail");
        assert!(matches!(nothing, StoreError::Misuse { .. }));

        store
            .update_vehicle_fields("bus002", Some(false), Some("R9"), Some(VehicleType::Tram))
            .expect("update should work");
        let loaded = store
            .get_vehicle("bus002")
            .expect("lookup should work")
            .expect("vehicle should exist");
        assert!(!loaded.active);
        assert_eq!(loaded.route, "R9");
        assert_eq!(loaded.vehicle_type, VehicleType::Tram);

        let missing = store
            .update_vehicle_fields("ghost", Some(true), None, None)
            .expect_err("unknown vehicle should fail");
        assert!(matches!(missing, StoreError::NotFound { .. }));
    }

    #[test]
    fn capacity_updates_enforce_ranges() {
        let fixture = TempStore::new("capacity");
        let store = &fixture.store;
        store
            .register_vehicle(&sample_vehicle("bus003", 50))
            .expect("vehicle should register");

        for (capacity, available) in [(-1, 0), (10, -1), (10, 11)] {
            let error = store
                .update_vehicle_capacity("bus003", capacity, available)
                .expect_err("invalid range should fail");
            assert!(matches!(error, StoreError::Misuse { .. }));
        }

        store
            .update_vehicle_capacity("bus003", 60, 45)
            .expect("valid update should work");
        let loaded = store
            .get_vehicle("bus003")
            .expect("lookup should work")
            .expect("vehicle should exist");
        assert_eq!(loaded.capacity, 60);
        assert_eq!(loaded.available_seats, 45);
    }

    #[test]
    fn tickets_and_payments_round_trip() {
        let fixture = TempStore::new("tickets");
        let store = &fixture.store;
        store
            .register_user(&sample_user("3333333333333"))
            .expect("user should register");

        let ticket = Ticket {
            ticket_id: "TKT_1_1700000000".to_owned(),
            user_urn: "3333333333333".to_owned(),
            ticket_type: TicketType::Individual,
            vehicle_type: VehicleType::Bus,
            route: "R2".to_owned(),
            price: 1.0,
            discount: 0.0,
            purchase_date: local_timestamp(),
            seat_number: "12".to_owned(),
            used: false,
        };
        store.create_ticket(&ticket).expect("ticket should insert");
        assert_eq!(
            store
                .get_ticket("TKT_1_1700000000")
                .expect("lookup should work")
                .expect("ticket should exist"),
            ticket
        );
        assert_eq!(
            store
                .get_user_tickets("3333333333333")
                .expect("listing should work"),
            vec![ticket.clone()]
        );

        let payment = Payment {
            transaction_id: "TX_1_1700000000".to_owned(),
            ticket_id: Some(ticket.ticket_id.clone()),
            amount: 1.0,
            payment_method: "card".to_owned(),
            payment_date: local_timestamp(),
            successful: true,
        };
        store
            .record_payment(&payment)
            .expect("payment should insert");
        assert_eq!(
            store
                .get_payment("TX_1_1700000000")
                .expect("lookup should work")
                .expect("payment should exist"),
            payment
        );
        assert_eq!(
            store
                .get_ticket_payments(&ticket.ticket_id)
                .expect("listing should work"),
            vec![payment]
        );

        // payments may reference no ticket at all
        let orphan = Payment {
            transaction_id: "TX_2_1700000000".to_owned(),
            ticket_id: None,
            amount: 2.5,
            payment_method: "card".to_owned(),
            payment_date: local_timestamp(),
            successful: false,
        };
        store.record_payment(&orphan).expect("null ticket id is allowed");
    }

    #[test]
    fn price_upsert_updates_then_inserts() {
        let fixture = TempStore::new("prices");
        let store = &fixture.store;

        store
            .update_price(VehicleType::Bus, TicketType::Individual, 2.5)
            .expect("insert path should work");
        let first = store
            .get_price(VehicleType::Bus, TicketType::Individual)
            .expect("lookup should work")
            .expect("price should exist");
        assert_eq!(first.base_price, 2.5);
        assert_eq!(first.distance_multiplier, 1.0);
        assert_eq!(first.time_multiplier, 1.0);

        store
            .update_price(VehicleType::Bus, TicketType::Individual, 3.0)
            .expect("update path should work");
        let second = store
            .get_price(VehicleType::Bus, TicketType::Individual)
            .expect("lookup should work")
            .expect("price should exist");
        assert_eq!(second.base_price, 3.0);

        assert!(store
            .get_price(VehicleType::Tram, TicketType::Individual)
            .expect("lookup should work")
            .is_none());
    }

    #[test]
    fn discount_policy_family_or_three_plus() {
        let fixture = TempStore::new("discounts");
        let store = &fixture.store;

        assert_eq!(store.calculate_discount(TicketType::GroupFamily, 1), 0.10);
        assert_eq!(store.calculate_discount(TicketType::Individual, 3), 0.10);
        assert_eq!(store.calculate_discount(TicketType::Individual, 2), 0.0);
        assert_eq!(store.calculate_discount(TicketType::GroupBusiness, 1), 0.0);
    }

    #[test]
    fn placeholder_price_is_flat() {
        let fixture = TempStore::new("placeholder-price");
        let store = &fixture.store;
        store
            .update_price(VehicleType::Bus, TicketType::Individual, 99.0)
            .expect("price should insert");
        // the purchase flow intentionally ignores the price list
        assert_eq!(
            store.calculate_ticket_price(VehicleType::Bus, TicketType::Individual, 1, 1.0, 30.0),
            1.0
        );
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let fixture = TempStore::new("tx-rollback");
        let store = &fixture.store;
        store
            .register_vehicle(&sample_vehicle("bus004", 50))
            .expect("vehicle should register");

        let result: Result<(), StoreError> = store.in_transaction(|store| {
            store.update_seat_availability("bus004", 10)?;
            Err(StoreError::misuse("forced failure"))
        });
        assert!(result.is_err());

        assert_eq!(
            store
                .get_vehicle("bus004")
                .expect("lookup should work")
                .expect("vehicle should exist")
                .available_seats,
            50
        );
    }

    #[test]
    fn transaction_commits_on_success() {
        let fixture = TempStore::new("tx-commit");
        let store = &fixture.store;
        store
            .register_vehicle(&sample_vehicle("bus005", 50))
            .expect("vehicle should register");

        store
            .in_transaction(|store| store.update_seat_availability("bus005", 49))
            .expect("transaction should commit");
        assert_eq!(
            store
                .get_vehicle("bus005")
                .expect("lookup should work")
                .expect("vehicle should exist")
                .available_seats,
            49
        );
    }
}
