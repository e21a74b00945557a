use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::session::SessionRegistry;
use crate::store::{
    local_timestamp, Payment, StoreError, StorePool, Ticket, User, Vehicle,
};
use crate::wire::message::{Message, TicketType, VehicleType};

/// Handler failures carry the wire error code and human-readable message
/// that become the RESPONSE_ERROR frame.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Store(String),
}

impl HandlerError {
    pub fn error_code(&self) -> i32 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Store(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(message)
            | Self::Unauthorized(message)
            | Self::Forbidden(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::Store(message) => message,
        }
    }

    /// Store-code classification carried through to wire codes.
    fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::Constraint { message } => Self::Conflict(message),
            StoreError::NotFound { message } => Self::NotFound(message),
            StoreError::Misuse { message } => Self::BadRequest(message),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        Self::from_store(error)
    }
}

/// Domain event to fan out to subscribed connections after the response.
#[derive(Debug, PartialEq, Eq)]
pub struct BroadcastUpdate {
    pub update_type: &'static str,
    pub fields: Vec<(&'static str, String)>,
}

impl BroadcastUpdate {
    pub fn to_message(&self) -> Message {
        Message::multicast_update(self.update_type, &self.fields)
    }
}

/// What a handler hands back to the connection worker: exactly one response,
/// an optional fan-out event, and (for AUTH) a freshly bound session.
#[derive(Debug)]
pub struct HandlerReply {
    pub response: Message,
    pub broadcast: Option<BroadcastUpdate>,
    pub new_session: Option<String>,
}

impl HandlerReply {
    fn response(response: Message) -> Self {
        Self {
            response,
            broadcast: None,
            new_session: None,
        }
    }

    fn with_broadcast(response: Message, broadcast: BroadcastUpdate) -> Self {
        Self {
            response,
            broadcast: Some(broadcast),
            new_session: None,
        }
    }
}

pub type HandlerResult = Result<HandlerReply, HandlerError>;

pub struct HandlerContext {
    pub pool: Arc<StorePool>,
    pub sessions: Arc<SessionRegistry>,
    ticket_counter: AtomicU64,
    transaction_counter: AtomicU64,
}

impl HandlerContext {
    pub fn new(pool: Arc<StorePool>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            pool,
            sessions,
            ticket_counter: AtomicU64::new(0),
            transaction_counter: AtomicU64::new(0),
        }
    }

    fn next_ticket_id(&self) -> String {
        let counter = self.ticket_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("TKT_{counter}_{}", Utc::now().timestamp())
    }

    fn next_transaction_id(&self) -> String {
        let counter = self.transaction_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("TX_{counter}_{}", Utc::now().timestamp())
    }

    /// Internal admin API: deletion happens only with explicit approval.
    /// The wire DELETE_USER handler never calls this with `true`.
    pub fn process_user_deletion(
        &self,
        urn: &str,
        admin_approved: bool,
    ) -> Result<bool, HandlerError> {
        if !admin_approved {
            return Ok(false);
        }

        let store = self.pool.lease();
        if store.get_user(urn).map_err(HandlerError::from)?.is_none() {
            return Err(HandlerError::NotFound("User not found".to_owned()));
        }
        store.delete_user(urn).map_err(HandlerError::from)?;
        Ok(true)
    }
}

pub fn validate_urn(urn: &str) -> bool {
    urn.len() == 13 && urn.bytes().all(|byte| byte.is_ascii_digit())
}

pub fn validate_uri(uri: &str) -> bool {
    !uri.is_empty() && uri.len() <= 32
}

// ----- connection / identity -----

pub fn handle_connect_request(message: &Message) -> HandlerResult {
    let client_id = message.get_string("client_id");
    let _ = client_id; // optional; connect succeeds regardless
    Ok(HandlerReply::response(Message::connect_response(
        true,
        "Connection established",
    )))
}

/// Presence of a registered user with the given urn is sufficient; a `pin`
/// field in the payload is ignored.
pub fn handle_auth_request(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let urn = message.get_string("urn");
    if urn.is_empty() {
        return Ok(HandlerReply::response(Message::auth_response(false, None)));
    }

    let registered = {
        let store = ctx.pool.lease();
        store.get_user(&urn).map_err(HandlerError::from)?.is_some()
    };
    if !registered {
        return Ok(HandlerReply::response(Message::auth_response(false, None)));
    }

    let session_id = ctx.sessions.create(&urn);
    Ok(HandlerReply {
        response: Message::auth_response(true, Some(&session_id)),
        broadcast: None,
        new_session: Some(session_id),
    })
}

pub fn handle_register_user(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let urn = message.get_string("urn");
    if !validate_urn(&urn) {
        return Err(HandlerError::BadRequest("Invalid URN format".to_owned()));
    }

    let store = ctx.pool.lease();
    if store.get_user(&urn).map_err(HandlerError::from)?.is_some() {
        return Err(HandlerError::Conflict("User already registered".to_owned()));
    }

    let user = User {
        urn: urn.clone(),
        name: if message.has_key("name") {
            message.get_string("name")
        } else {
            format!("User_{urn}")
        },
        age: if message.has_key("age") {
            message.get_int("age")
        } else {
            25
        },
        registration_date: local_timestamp(),
        active: true,
        pin_hash: if message.has_key("pin_hash") {
            message.get_string("pin_hash")
        } else {
            "default_hash".to_owned()
        },
    };

    match store.register_user(&user) {
        Ok(()) => Ok(HandlerReply::response(Message::success_response(
            "User registered successfully",
            &[],
        ))),
        Err(StoreError::Constraint { .. }) => {
            Err(HandlerError::Conflict("User already registered".to_owned()))
        }
        Err(error) => Err(HandlerError::Store(error.to_string())),
    }
}

pub fn handle_register_device(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let uri = message.get_string("uri");
    if !validate_uri(&uri) {
        return Err(HandlerError::BadRequest("Invalid URI format".to_owned()));
    }
    let Some(vehicle_type) = VehicleType::from_code(message.get_int("vehicle_type")) else {
        return Err(HandlerError::BadRequest("Invalid vehicle type".to_owned()));
    };

    let vehicle = Vehicle {
        uri: uri.clone(),
        vehicle_type,
        capacity: 50,
        available_seats: 50,
        route: format!("Route_{uri}"),
        active: true,
        last_update: local_timestamp(),
    };

    let store = ctx.pool.lease();
    match store.register_vehicle(&vehicle) {
        Ok(()) => Ok(HandlerReply::response(Message::success_response(
            "Device registered successfully",
            &[],
        ))),
        Err(StoreError::Constraint { .. }) => {
            Err(HandlerError::Conflict("Device already exists".to_owned()))
        }
        Err(error) => Err(HandlerError::Store(error.to_string())),
    }
}

// ----- reservation / purchase -----

/// Looks up the vehicle by uri when given, else by (route, type), else by
/// trying the other vehicle types on the same route.
fn resolve_vehicle(
    store: &crate::store::Store,
    uri: &str,
    route: &str,
    vehicle_type: Option<VehicleType>,
    try_other_types: bool,
) -> Result<Option<Vehicle>, StoreError> {
    if !uri.is_empty() {
        if let Some(vehicle) = store.get_vehicle(uri)? {
            return Ok(Some(vehicle));
        }
    }
    if route.is_empty() {
        return Ok(None);
    }

    if let Some(requested) = vehicle_type {
        if let Some(vehicle) = store.get_vehicle_by_route_and_type(route, requested)? {
            return Ok(Some(vehicle));
        }
    }
    if try_other_types {
        for candidate in VehicleType::ALL {
            if Some(candidate) == vehicle_type {
                continue;
            }
            if let Some(vehicle) = store.get_vehicle_by_route_and_type(route, candidate)? {
                return Ok(Some(vehicle));
            }
        }
    }
    Ok(None)
}

pub fn handle_reserve_seat(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let urn = message.get_string("urn");
    if urn.is_empty() {
        return Err(HandlerError::BadRequest("Missing user URN".to_owned()));
    }
    let uri = message.get_string("uri");
    let route = message.get_string("route");
    let vehicle_type = VehicleType::from_code(message.get_int("vehicle_type"));

    let store = ctx.pool.lease();
    // Read-check-update under one IMMEDIATE transaction; concurrent
    // reservations against the same vehicle serialize here and never
    // oversell.
    let (vehicle, new_available) = store
        .in_transaction(|store| {
            let vehicle = resolve_vehicle(store, &uri, &route, vehicle_type, true)?
                .ok_or_else(|| StoreError::not_found("Vehicle/route not found"))?;
            if vehicle.available_seats <= 0 {
                return Err(StoreError::constraint("No available seats"));
            }
            let new_available = vehicle.available_seats - 1;
            store.update_seat_availability(&vehicle.uri, new_available)?;
            Ok((vehicle, new_available))
        })
        .map_err(HandlerError::from)?;

    let fields = [
        ("route", vehicle.route.clone()),
        ("vehicle_uri", vehicle.uri.clone()),
        ("available_seats", new_available.to_string()),
    ];
    Ok(HandlerReply::with_broadcast(
        Message::success_response("Seat reserved successfully", &fields),
        BroadcastUpdate {
            update_type: "seat_reserved",
            fields: fields.to_vec(),
        },
    ))
}

pub fn handle_purchase_ticket(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    // session_id is the preferred identity; a bare urn is accepted.
    let urn = if message.has_key("session_id") {
        let session_id = message.get_string("session_id");
        ctx.sessions.touch(&session_id).ok_or_else(|| {
            HandlerError::Unauthorized("Invalid or expired session".to_owned())
        })?
    } else if message.has_key("urn") {
        message.get_string("urn")
    } else {
        String::new()
    };
    if urn.is_empty() {
        return Err(HandlerError::BadRequest(
            "Missing user identity (session_id or urn)".to_owned(),
        ));
    }

    let Some(ticket_type) = TicketType::from_code(message.get_int("ticket_type")) else {
        return Err(HandlerError::BadRequest("Invalid ticket type".to_owned()));
    };
    let vehicle_type = VehicleType::from_code(message.get_int("vehicle_type"));
    let uri = message.get_string("uri");
    let route = message.get_string("route");
    let passengers = message.get_int("passengers").max(1);

    let store = ctx.pool.lease();
    let (vehicle, new_available, total_amount) = store
        .in_transaction(|store| {
            let vehicle = resolve_vehicle(store, &uri, &route, vehicle_type, false)?
                .ok_or_else(|| StoreError::not_found("Vehicle/route not found"))?;
            if vehicle.available_seats < passengers {
                return Err(StoreError::constraint("Insufficient seats available"));
            }

            let price_each =
                store.calculate_ticket_price(vehicle.vehicle_type, ticket_type, 1, 1.0, 30.0);
            let discount = 0.0;
            let total_amount = price_each * f64::from(passengers);
            let purchase_date = local_timestamp();

            let mut first_ticket_id = None;
            for index in 0..passengers {
                let ticket = Ticket {
                    ticket_id: ctx.next_ticket_id(),
                    user_urn: urn.clone(),
                    ticket_type,
                    vehicle_type: vehicle.vehicle_type,
                    route: vehicle.route.clone(),
                    price: price_each,
                    discount,
                    purchase_date: purchase_date.clone(),
                    seat_number: (vehicle.capacity - vehicle.available_seats + index + 1)
                        .to_string(),
                    used: false,
                };
                store.create_ticket(&ticket)?;
                first_ticket_id.get_or_insert(ticket.ticket_id);
            }

            store.record_payment(&Payment {
                transaction_id: ctx.next_transaction_id(),
                ticket_id: first_ticket_id,
                amount: total_amount,
                payment_method: "card".to_owned(),
                payment_date: purchase_date,
                successful: true,
            })?;

            let new_available = vehicle.available_seats - passengers;
            store.update_seat_availability(&vehicle.uri, new_available)?;
            Ok((vehicle, new_available, total_amount))
        })
        .map_err(HandlerError::from)?;

    Ok(HandlerReply::with_broadcast(
        Message::success_response(
            "Ticket purchased successfully",
            &[
                ("total_amount", format!("{total_amount:.6}")),
                ("route", vehicle.route.clone()),
                ("vehicle_uri", vehicle.uri.clone()),
                ("available_seats", new_available.to_string()),
                ("passengers", passengers.to_string()),
                ("user_urn", urn.clone()),
            ],
        ),
        BroadcastUpdate {
            update_type: "ticket_purchased",
            fields: vec![
                ("route", vehicle.route),
                ("vehicle_uri", vehicle.uri),
                ("passengers", passengers.to_string()),
                ("available_seats", new_available.to_string()),
            ],
        },
    ))
}

// ----- groups -----

pub fn handle_create_group(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let group_name = message.get_string("group_name");
    let leader_urn = message.get_string("leader_urn");
    if group_name.is_empty() || leader_urn.is_empty() {
        return Err(HandlerError::BadRequest(
            "Missing group_name or leader_urn".to_owned(),
        ));
    }

    let store = ctx.pool.lease();
    store
        .create_group(&group_name, &leader_urn, "")
        .map_err(|error| HandlerError::Store(format!("Failed to create group: {error}")))?;

    Ok(HandlerReply::response(Message::success_response(
        "Group created successfully",
        &[],
    )))
}

fn require_session(ctx: &HandlerContext, session_id: &str) -> Result<String, HandlerError> {
    ctx.sessions
        .touch(session_id)
        .ok_or_else(|| HandlerError::Unauthorized("Invalid or expired session".to_owned()))
}

pub fn handle_add_member_to_group(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let session_id = message.get_string("session_id");
    let urn = message.get_string("urn");
    let group_name = message.get_string("group_name");
    if session_id.is_empty() || group_name.is_empty() || urn.is_empty() {
        return Err(HandlerError::BadRequest(
            "Missing required fields (session_id, group_name, urn)".to_owned(),
        ));
    }
    require_session(ctx, &session_id)?;

    let store = ctx.pool.lease();
    store
        .add_user_to_group(&urn, &group_name)
        .map_err(HandlerError::from)?;

    Ok(HandlerReply::response(Message::success_response(
        "User added to group",
        &[],
    )))
}

/// The caller's session must be bound to the group leader's urn.
fn require_group_leader(
    ctx: &HandlerContext,
    session_id: &str,
    group_name: &str,
) -> Result<(), HandlerError> {
    let caller_urn = require_session(ctx, session_id)?;

    let leader = {
        let store = ctx.pool.lease();
        store
            .get_group_leader(group_name)
            .map_err(HandlerError::from)?
    };
    let Some(leader) = leader else {
        return Err(HandlerError::NotFound(
            "Group not found or no leader set".to_owned(),
        ));
    };
    if leader != caller_urn {
        return Err(HandlerError::Forbidden(
            "Admin (group leader) privileges required".to_owned(),
        ));
    }
    Ok(())
}

pub fn handle_remove_member_from_group(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    let session_id = message.get_string("session_id");
    let urn = message.get_string("urn");
    let group_name = message.get_string("group_name");
    if session_id.is_empty() || group_name.is_empty() || urn.is_empty() {
        return Err(HandlerError::BadRequest(
            "Missing required fields (session_id, group_name, urn)".to_owned(),
        ));
    }

    require_group_leader(ctx, &session_id, &group_name)?;

    let store = ctx.pool.lease();
    store
        .remove_user_from_group(&urn, &group_name)
        .map_err(HandlerError::from)?;

    Ok(HandlerReply::response(Message::success_response(
        "User removed from group",
        &[],
    )))
}

/// The wire path acknowledges without deleting; actual removal is gated
/// behind the admin-approved internal API.
pub fn handle_delete_user(message: &Message) -> HandlerResult {
    let _urn = message.get_string("urn");
    Ok(HandlerReply::response(Message::success_response(
        "User deletion request submitted",
        &[],
    )))
}

// ----- admin updates -----

pub fn handle_update_price(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    if !message.has_key("vehicle_type") || !message.has_key("ticket_type") || !message.has_key("price")
    {
        return Err(HandlerError::BadRequest(
            "Missing vehicle_type/ticket_type/price".to_owned(),
        ));
    }
    let Some(vehicle_type) = VehicleType::from_code(message.get_int("vehicle_type")) else {
        return Err(HandlerError::BadRequest("Invalid vehicle type".to_owned()));
    };
    let Some(ticket_type) = TicketType::from_code(message.get_int("ticket_type")) else {
        return Err(HandlerError::BadRequest("Invalid ticket type".to_owned()));
    };
    let raw_price = message.get_string("price");
    let price: f64 = raw_price
        .parse()
        .map_err(|_| HandlerError::BadRequest("Invalid price format".to_owned()))?;

    let store = ctx.pool.lease();
    store
        .update_price(vehicle_type, ticket_type, price)
        .map_err(|error| HandlerError::Store(error.to_string()))?;

    Ok(HandlerReply::with_broadcast(
        Message::success_response("Price updated", &[]),
        BroadcastUpdate {
            update_type: "price_updated",
            fields: vec![
                ("vehicle_type", vehicle_type.code().to_string()),
                ("ticket_type", ticket_type.code().to_string()),
                ("price", raw_price),
            ],
        },
    ))
}

pub fn handle_update_vehicle(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    if !message.has_key("uri") {
        return Err(HandlerError::BadRequest("Missing uri".to_owned()));
    }
    let uri = message.get_string("uri");

    let active = message.has_key("active").then(|| message.get_int("active") != 0);
    let route = message.has_key("route").then(|| message.get_string("route"));
    let vehicle_type = if message.has_key("vehicle_type") {
        match VehicleType::from_code(message.get_int("vehicle_type")) {
            Some(vehicle_type) => Some(vehicle_type),
            None => {
                return Err(HandlerError::BadRequest("Invalid vehicle type".to_owned()))
            }
        }
    } else {
        None
    };

    if active.is_none() && route.is_none() && vehicle_type.is_none() {
        return Err(HandlerError::BadRequest("Nothing to update".to_owned()));
    }

    let store = ctx.pool.lease();
    store
        .update_vehicle_fields(&uri, active, route.as_deref(), vehicle_type)
        .map_err(HandlerError::from)?;

    Ok(HandlerReply::with_broadcast(
        Message::success_response("Vehicle updated", &[]),
        BroadcastUpdate {
            update_type: "vehicle_updated",
            fields: vec![("uri", uri)],
        },
    ))
}

pub fn handle_update_capacity(ctx: &HandlerContext, message: &Message) -> HandlerResult {
    if !message.has_key("uri") || !message.has_key("capacity") {
        return Err(HandlerError::BadRequest("Missing uri/capacity".to_owned()));
    }
    let uri = message.get_string("uri");
    let capacity = message.get_int("capacity");
    let available_seats = if message.has_key("available_seats") {
        message.get_int("available_seats")
    } else {
        capacity
    };

    let store = ctx.pool.lease();
    store
        .update_vehicle_capacity(&uri, capacity, available_seats)
        .map_err(HandlerError::from)?;

    Ok(HandlerReply::with_broadcast(
        Message::success_response("Capacity updated", &[]),
        BroadcastUpdate {
            update_type: "capacity_updated",
            fields: vec![
                ("uri", uri),
                ("capacity", capacity.to_string()),
                ("available_seats", available_seats.to_string()),
            ],
        },
    ))
}
