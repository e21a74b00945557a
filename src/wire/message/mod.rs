use std::fmt;

use crate::wire::codec::{
    self, CodecError, Header, PayloadMap, HEADER_SIZE_BYTES,
};

/// Closed table of wire message type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectRequest = 1,
    ConnectResponse = 2,
    AuthRequest = 3,
    AuthResponse = 4,
    RegisterUser = 5,
    RegisterDevice = 6,
    ReserveSeat = 7,
    PurchaseTicket = 8,
    CreateGroup = 9,
    DeleteUser = 10,
    DeleteGroupMember = 11,
    UpdatePriceList = 12, // reserved, unused
    GetVehicleStatus = 13,
    MulticastUpdate = 14,
    ResponseSuccess = 15,
    ResponseError = 16,
    Heartbeat = 17,
    Disconnect = 18,
    UpdatePrice = 19,
    UpdateVehicle = 20,
    UpdateCapacity = 21,
    AddMemberToGroup = 1001,
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::ConnectRequest),
            2 => Some(Self::ConnectResponse),
            3 => Some(Self::AuthRequest),
            4 => Some(Self::AuthResponse),
            5 => Some(Self::RegisterUser),
            6 => Some(Self::RegisterDevice),
            7 => Some(Self::ReserveSeat),
            8 => Some(Self::PurchaseTicket),
            9 => Some(Self::CreateGroup),
            10 => Some(Self::DeleteUser),
            11 => Some(Self::DeleteGroupMember),
            12 => Some(Self::UpdatePriceList),
            13 => Some(Self::GetVehicleStatus),
            14 => Some(Self::MulticastUpdate),
            15 => Some(Self::ResponseSuccess),
            16 => Some(Self::ResponseError),
            17 => Some(Self::Heartbeat),
            18 => Some(Self::Disconnect),
            19 => Some(Self::UpdatePrice),
            20 => Some(Self::UpdateVehicle),
            21 => Some(Self::UpdateCapacity),
            1001 => Some(Self::AddMemberToGroup),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectRequest => "CONNECT_REQUEST",
            Self::ConnectResponse => "CONNECT_RESPONSE",
            Self::AuthRequest => "AUTH_REQUEST",
            Self::AuthResponse => "AUTH_RESPONSE",
            Self::RegisterUser => "REGISTER_USER",
            Self::RegisterDevice => "REGISTER_DEVICE",
            Self::ReserveSeat => "RESERVE_SEAT",
            Self::PurchaseTicket => "PURCHASE_TICKET",
            Self::CreateGroup => "CREATE_GROUP",
            Self::DeleteUser => "DELETE_USER",
            Self::DeleteGroupMember => "DELETE_GROUP_MEMBER",
            Self::UpdatePriceList => "UPDATE_PRICE_LIST",
            Self::GetVehicleStatus => "GET_VEHICLE_STATUS",
            Self::MulticastUpdate => "MULTICAST_UPDATE",
            Self::ResponseSuccess => "RESPONSE_SUCCESS",
            Self::ResponseError => "RESPONSE_ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
            Self::UpdatePrice => "UPDATE_PRICE",
            Self::UpdateVehicle => "UPDATE_VEHICLE",
            Self::UpdateCapacity => "UPDATE_CAPACITY",
            Self::AddMemberToGroup => "ADD_MEMBER_TO_GROUP",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VehicleType {
    Bus = 1,
    Tram = 2,
    Trolleybus = 3,
}

impl VehicleType {
    pub const ALL: [VehicleType; 3] = [Self::Bus, Self::Tram, Self::Trolleybus];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Bus),
            2 => Some(Self::Tram),
            3 => Some(Self::Trolleybus),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bus => "BUS",
            Self::Tram => "TRAM",
            Self::Trolleybus => "TROLLEYBUS",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TicketType {
    Individual = 1,
    GroupFamily = 2,
    GroupBusiness = 3,
    GroupTourist = 4,
}

impl TicketType {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Individual),
            2 => Some(Self::GroupFamily),
            3 => Some(Self::GroupBusiness),
            4 => Some(Self::GroupTourist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "INDIVIDUAL",
            Self::GroupFamily => "GROUP_FAMILY",
            Self::GroupBusiness => "GROUP_BUSINESS",
            Self::GroupTourist => "GROUP_TOURIST",
        }
    }
}

impl fmt::Display for TicketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wire message: fixed header plus key/value payload.
///
/// The payload map is ordered, so serialization is deterministic and
/// `decode(encode(m)) == m` holds byte-for-byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    header: Header,
    data: PayloadMap,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            header: Header::new(message_type.code()),
            data: PayloadMap::new(),
        }
    }

    pub fn type_code(&self) -> u16 {
        self.header.type_code
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_code(self.header.type_code)
    }

    pub fn sequence_id(&self) -> u32 {
        self.header.sequence_id
    }

    pub fn set_sequence_id(&mut self, sequence_id: u32) {
        self.header.sequence_id = sequence_id;
    }

    /// Reserved numeric header field; the string session token travels in the
    /// payload instead.
    pub fn session_ref(&self) -> u32 {
        self.header.session_ref
    }

    pub fn set_session_ref(&mut self, session_ref: u32) {
        self.header.session_ref = session_ref;
    }

    pub fn data(&self) -> &PayloadMap {
        &self.data
    }

    pub fn add_string(&mut self, key: &str, value: impl Into<String>) {
        self.data.insert(key.to_owned(), value.into());
    }

    pub fn add_int(&mut self, key: &str, value: i32) {
        self.data.insert(key.to_owned(), value.to_string());
    }

    pub fn add_double(&mut self, key: &str, value: f64) {
        self.data.insert(key.to_owned(), format!("{value:.6}"));
    }

    pub fn add_bool(&mut self, key: &str, value: bool) {
        self.data
            .insert(key.to_owned(), if value { "true" } else { "false" }.to_owned());
    }

    pub fn add_binary(&mut self, key: &str, value: &[u8]) {
        let encoded = value
            .iter()
            .map(|byte| byte.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.data.insert(key.to_owned(), encoded);
    }

    pub fn get_string(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }

    pub fn get_int(&self, key: &str) -> i32 {
        self.data
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    pub fn get_double(&self, key: &str) -> f64 {
        self.data
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.data.get(key).is_some_and(|value| value == "true")
    }

    pub fn get_binary(&self, key: &str) -> Vec<u8> {
        let Some(raw) = self.data.get(key) else {
            return Vec::new();
        };
        raw.split(',')
            .filter(|token| !token.is_empty())
            .filter_map(|token| token.parse().ok())
            .collect()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Serializes header+payload. The payload length field always reflects
    /// the current payload, the checksum field whatever was last computed.
    pub fn serialize(&self) -> Vec<u8> {
        let payload = codec::encode_payload(&self.data);
        let mut header = self.header;
        header.payload_length = payload.len() as u32;

        let mut out = Vec::with_capacity(HEADER_SIZE_BYTES + payload.len());
        header.encode_into(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Serializes with a 4-byte network-order length prefix for stream
    /// transports.
    pub fn serialize_stream(&self) -> Vec<u8> {
        let frame = self.serialize();
        let mut out = Vec::with_capacity(4 + frame.len());
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(&frame);
        out
    }

    /// Parses a header+payload frame. Structural errors (truncation, length
    /// mismatch) fail here; magic/version/checksum problems parse fine and
    /// surface through `is_valid`.
    pub fn deserialize(frame: &[u8]) -> Result<Self, CodecError> {
        let header = Header::decode(frame)?;
        let available = frame.len() - HEADER_SIZE_BYTES;
        let declared = header.payload_length as usize;
        if declared != available {
            return Err(CodecError::PayloadLengthMismatch {
                declared,
                available,
            });
        }

        let data = codec::decode_payload(&frame[HEADER_SIZE_BYTES..])?;
        Ok(Self { header, data })
    }

    /// Computes and stores the CRC-32 over the whole frame with the checksum
    /// field zeroed. Every factory calls this; callers mutating a message
    /// afterwards must call it again.
    pub fn finalize_checksum(&mut self) {
        self.header.checksum = 0;
        let bytes = self.serialize();
        self.header.checksum = codec::frame_checksum(&bytes);
    }

    pub fn verify_checksum(&self) -> bool {
        let mut probe = self.clone();
        probe.header.checksum = 0;
        codec::frame_checksum(&probe.serialize()) == self.header.checksum
    }

    pub fn is_valid(&self) -> bool {
        self.header.magic == codec::MAGIC
            && self.header.version == codec::PROTOCOL_VERSION
            && self.verify_checksum()
    }

    // ----- factories -----

    pub fn connect_request(client_id: &str) -> Self {
        let mut message = Self::new(MessageType::ConnectRequest);
        message.add_string("client_id", client_id);
        message.add_string("protocol_version", "1.0");
        message.finalize_checksum();
        message
    }

    pub fn connect_response(success: bool, reason: &str) -> Self {
        let mut message = Self::new(MessageType::ConnectResponse);
        message.add_bool("success", success);
        if !reason.is_empty() {
            message.add_string("reason", reason);
        }
        message.finalize_checksum();
        message
    }

    pub fn auth_request(urn: &str, pin: Option<&str>) -> Self {
        let mut message = Self::new(MessageType::AuthRequest);
        message.add_string("urn", urn);
        if let Some(pin) = pin {
            message.add_string("pin", pin);
        }
        message.finalize_checksum();
        message
    }

    /// The token goes out under the key "token"; the client echoes it back as
    /// "session_id" in later requests.
    pub fn auth_response(success: bool, token: Option<&str>) -> Self {
        let mut message = Self::new(MessageType::AuthResponse);
        message.add_bool("success", success);
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            message.add_string("token", token);
        }
        message.finalize_checksum();
        message
    }

    pub fn register_user(urn: &str) -> Self {
        let mut message = Self::new(MessageType::RegisterUser);
        message.add_string("urn", urn);
        message.finalize_checksum();
        message
    }

    pub fn register_device(uri: &str, vehicle_type: VehicleType) -> Self {
        let mut message = Self::new(MessageType::RegisterDevice);
        message.add_string("uri", uri);
        message.add_int("vehicle_type", vehicle_type.code());
        message.finalize_checksum();
        message
    }

    pub fn reserve_seat(urn: &str, vehicle_type: VehicleType, route: &str) -> Self {
        let mut message = Self::new(MessageType::ReserveSeat);
        message.add_string("urn", urn);
        message.add_int("vehicle_type", vehicle_type.code());
        if !route.is_empty() {
            message.add_string("route", route);
        }
        message.finalize_checksum();
        message
    }

    pub fn purchase_ticket(
        ticket_type: TicketType,
        vehicle_type: VehicleType,
        route: &str,
        passengers: i32,
    ) -> Self {
        let mut message = Self::new(MessageType::PurchaseTicket);
        message.add_int("ticket_type", ticket_type.code());
        message.add_int("vehicle_type", vehicle_type.code());
        if !route.is_empty() {
            message.add_string("route", route);
        }
        message.add_int("passengers", passengers);
        message.finalize_checksum();
        message
    }

    pub fn create_group(group_name: &str, leader_urn: &str) -> Self {
        let mut message = Self::new(MessageType::CreateGroup);
        message.add_string("group_name", group_name);
        if !leader_urn.is_empty() {
            message.add_string("leader_urn", leader_urn);
        }
        message.finalize_checksum();
        message
    }

    pub fn delete_user(urn: &str, reason: &str) -> Self {
        let mut message = Self::new(MessageType::DeleteUser);
        message.add_string("urn", urn);
        if !reason.is_empty() {
            message.add_string("reason", reason);
        }
        message.finalize_checksum();
        message
    }

    pub fn add_member_to_group(group_name: &str, member_urn: &str, session_id: &str) -> Self {
        let mut message = Self::new(MessageType::AddMemberToGroup);
        message.add_string("group_name", group_name);
        message.add_string("urn", member_urn);
        if !session_id.is_empty() {
            message.add_string("session_id", session_id);
        }
        message.finalize_checksum();
        message
    }

    pub fn remove_member_from_group(group_name: &str, member_urn: &str, session_id: &str) -> Self {
        let mut message = Self::new(MessageType::DeleteGroupMember);
        message.add_string("group_name", group_name);
        message.add_string("urn", member_urn);
        if !session_id.is_empty() {
            message.add_string("session_id", session_id);
        }
        message.finalize_checksum();
        message
    }

    pub fn update_price(vehicle_type: VehicleType, ticket_type: TicketType, price: f64) -> Self {
        let mut message = Self::new(MessageType::UpdatePrice);
        message.add_int("vehicle_type", vehicle_type.code());
        message.add_int("ticket_type", ticket_type.code());
        message.add_double("price", price);
        message.finalize_checksum();
        message
    }

    pub fn update_vehicle(
        uri: &str,
        active: Option<bool>,
        route: Option<&str>,
        vehicle_type: Option<VehicleType>,
    ) -> Self {
        let mut message = Self::new(MessageType::UpdateVehicle);
        message.add_string("uri", uri);
        if let Some(active) = active {
            message.add_int("active", if active { 1 } else { 0 });
        }
        if let Some(route) = route {
            message.add_string("route", route);
        }
        if let Some(vehicle_type) = vehicle_type {
            message.add_int("vehicle_type", vehicle_type.code());
        }
        message.finalize_checksum();
        message
    }

    pub fn update_capacity(uri: &str, capacity: i32, available_seats: i32) -> Self {
        let mut message = Self::new(MessageType::UpdateCapacity);
        message.add_string("uri", uri);
        message.add_int("capacity", capacity);
        message.add_int("available_seats", available_seats);
        message.finalize_checksum();
        message
    }

    pub fn success_response(text: &str, data: &[(&str, String)]) -> Self {
        let mut message = Self::new(MessageType::ResponseSuccess);
        if !text.is_empty() {
            message.add_string("message", text);
        }
        for (key, value) in data {
            message.add_string(key, value.clone());
        }
        message.finalize_checksum();
        message
    }

    pub fn error_response(error: &str, error_code: i32) -> Self {
        let mut message = Self::new(MessageType::ResponseError);
        message.add_string("error", error);
        message.add_int("error_code", error_code);
        message.finalize_checksum();
        message
    }

    pub fn heartbeat(unix_timestamp: i64) -> Self {
        let mut message = Self::new(MessageType::Heartbeat);
        message.add_string("timestamp", unix_timestamp.to_string());
        message.finalize_checksum();
        message
    }

    pub fn disconnect() -> Self {
        let mut message = Self::new(MessageType::Disconnect);
        message.finalize_checksum();
        message
    }

    pub fn multicast_update(update_type: &str, data: &[(&str, String)]) -> Self {
        let mut message = Self::new(MessageType::MulticastUpdate);
        message.add_string("update_type", update_type);
        for (key, value) in data {
            message.add_string(key, value.clone());
        }
        message.finalize_checksum();
        message
    }
}
