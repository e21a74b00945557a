use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logging::Logger;
use crate::transport::{is_poll_timeout, ServerChannel};
use crate::wire::codec::FrameReader;
use crate::wire::message::{Message, MessageType};

use super::broadcast::SubscriberRegistry;
use super::handlers::{
    handle_add_member_to_group, handle_auth_request, handle_connect_request, handle_create_group,
    handle_delete_user, handle_purchase_ticket, handle_register_device, handle_register_user,
    handle_remove_member_from_group, handle_reserve_seat, handle_update_capacity,
    handle_update_price, handle_update_vehicle, HandlerContext, HandlerResult,
};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Per-connection authentication state. Set once AUTH succeeds; the session
/// itself lives in the registry and expires independently.
struct ConnectionState {
    session_id: Option<String>,
}

/// Operations other than these three require an authenticated connection.
fn requires_authentication(kind: MessageType) -> bool {
    !matches!(
        kind,
        MessageType::ConnectRequest | MessageType::AuthRequest | MessageType::RegisterUser
    )
}

/// The per-connection loop: accumulate frames, validate, dispatch, respond.
/// Runs until the peer disconnects, an I/O error occurs, or the shared stop
/// signal is raised.
pub fn run_connection(
    channel: Arc<ServerChannel>,
    ctx: Arc<HandlerContext>,
    subscribers: Arc<SubscriberRegistry>,
    logger: Arc<Logger>,
    stop_signal: Arc<AtomicBool>,
    max_frame_size: usize,
) {
    let connection_id = channel.id();
    logger.info(
        Some("server::worker"),
        &format!(
            "client connected from {} (connection {connection_id})",
            channel.peer_addr()
        ),
    );

    let mut reader = FrameReader::new(max_frame_size);
    let mut state = ConnectionState { session_id: None };
    let mut buffer = vec![0_u8; READ_BUFFER_SIZE];

    'connection: while !stop_signal.load(Ordering::SeqCst) {
        match channel.read_chunk(&mut buffer) {
            Ok(0) => break,
            Ok(size) => {
                reader.push(&buffer[..size]);
                loop {
                    match reader.next_frame() {
                        Ok(Some(frame)) => {
                            process_frame(&frame, &channel, &ctx, &subscribers, &logger, &mut state);
                        }
                        Ok(None) => break,
                        // Desynchronized framing cannot be recovered; tell
                        // the peer and drop the connection.
                        Err(error) => {
                            logger.warn(
                                Some("server::worker"),
                                &format!("framing error on connection {connection_id}: {error}"),
                            );
                            let _ = channel
                                .send_message(&Message::error_response("bad frame", 400));
                            break 'connection;
                        }
                    }
                }
            }
            Err(error) if is_poll_timeout(error.kind()) => continue,
            Err(error) => {
                logger.debug(
                    Some("server::worker"),
                    &format!("read ended on connection {connection_id}: {error}"),
                );
                break;
            }
        }
    }

    subscribers.remove(connection_id);
    channel.shutdown();
    logger.info(
        Some("server::worker"),
        &format!("client disconnected (connection {connection_id})"),
    );
}

fn process_frame(
    frame: &[u8],
    channel: &Arc<ServerChannel>,
    ctx: &Arc<HandlerContext>,
    subscribers: &Arc<SubscriberRegistry>,
    logger: &Logger,
    state: &mut ConnectionState,
) {
    let connection_id = channel.id();

    let message = match Message::deserialize(frame) {
        Ok(message) => message,
        Err(error) => {
            logger.warn(
                Some("server::worker"),
                &format!("undecodable frame on connection {connection_id}: {error}"),
            );
            send_response(channel, &Message::error_response("bad frame", 400), logger);
            return;
        }
    };

    if !message.is_valid() {
        logger.warn(
            Some("server::worker"),
            &format!("invalid frame on connection {connection_id} (magic/version/checksum)"),
        );
        send_response(channel, &Message::error_response("bad frame", 400), logger);
        return;
    }

    let Some(kind) = message.kind() else {
        logger.warn(
            Some("server::worker"),
            &format!(
                "unknown message type {} on connection {connection_id}",
                message.type_code()
            ),
        );
        send_response(
            channel,
            &Message::error_response("Unknown message type", 400),
            logger,
        );
        return;
    };

    logger.debug(
        Some("server::worker"),
        &format!("connection {connection_id}: {kind}"),
    );

    let result: HandlerResult = match kind {
        MessageType::ConnectRequest => handle_connect_request(&message),
        MessageType::AuthRequest => handle_auth_request(ctx, &message),
        MessageType::RegisterUser => handle_register_user(ctx, &message),
        MessageType::RegisterDevice
        | MessageType::ReserveSeat
        | MessageType::PurchaseTicket
        | MessageType::CreateGroup
        | MessageType::AddMemberToGroup
        | MessageType::DeleteGroupMember
        | MessageType::DeleteUser
        | MessageType::UpdatePrice
        | MessageType::UpdateVehicle
        | MessageType::UpdateCapacity => {
            if requires_authentication(kind) && state.session_id.is_none() {
                send_response(
                    channel,
                    &Message::error_response("Authentication required", 401),
                    logger,
                );
                return;
            }
            match kind {
                MessageType::RegisterDevice => handle_register_device(ctx, &message),
                MessageType::ReserveSeat => handle_reserve_seat(ctx, &message),
                MessageType::PurchaseTicket => handle_purchase_ticket(ctx, &message),
                MessageType::CreateGroup => handle_create_group(ctx, &message),
                MessageType::AddMemberToGroup => handle_add_member_to_group(ctx, &message),
                MessageType::DeleteGroupMember => handle_remove_member_from_group(ctx, &message),
                MessageType::DeleteUser => handle_delete_user(&message),
                MessageType::UpdatePrice => handle_update_price(ctx, &message),
                MessageType::UpdateVehicle => handle_update_vehicle(ctx, &message),
                MessageType::UpdateCapacity => handle_update_capacity(ctx, &message),
                _ => unreachable!("guarded match arm"),
            }
        }
        // Reserved and peer-push codes have no server-side operation.
        MessageType::ConnectResponse
        | MessageType::AuthResponse
        | MessageType::UpdatePriceList
        | MessageType::GetVehicleStatus
        | MessageType::MulticastUpdate
        | MessageType::ResponseSuccess
        | MessageType::ResponseError
        | MessageType::Heartbeat
        | MessageType::Disconnect => {
            send_response(
                channel,
                &Message::error_response("Unknown message type", 400),
                logger,
            );
            return;
        }
    };

    match result {
        Ok(reply) => {
            if let Some(session_id) = reply.new_session {
                state.session_id = Some(session_id);
                subscribers.add(connection_id, channel);
            }
            send_response(channel, &reply.response, logger);
            if let Some(update) = reply.broadcast {
                let delivered = subscribers.broadcast(&update.to_message(), logger);
                logger.debug(
                    Some("server::broadcast"),
                    &format!(
                        "{} fanned out to {delivered} subscriber(s)",
                        update.update_type
                    ),
                );
            }
        }
        Err(error) => {
            logger.warn(
                Some("server::worker"),
                &format!(
                    "{kind} failed on connection {connection_id}: {} ({})",
                    error.message(),
                    error.error_code()
                ),
            );
            send_response(
                channel,
                &Message::error_response(error.message(), error.error_code()),
                logger,
            );
        }
    }
}

fn send_response(channel: &Arc<ServerChannel>, response: &Message, logger: &Logger) {
    if let Err(error) = channel.send_message(response) {
        logger.warn(
            Some("server::worker"),
            &format!(
                "failed to write response on connection {}: {error}",
                channel.id()
            ),
        );
    }
}
