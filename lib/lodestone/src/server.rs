use crate::config::ServerConfig;
use crate::runtime::Runtime;
use byteorder::{ByteOrder, LittleEndian};
use magnetite::address::Address;
use magnetite::crypto;
use magnetite::header::{
    self, Header, PacketType, BACKUP_BYTES, HEADER_BYTES, PING_PONG_BYTES,
};
use magnetite::logging::{self, Logger};
use magnetite::replay::ReplayProtection;
use magnetite::sequence::sequence_greater_than;
use magnetite::time::Clock;
use magnetite::token::{
    ContinueToken, FlowToken, ServerToken, SEALED_CONTINUE_TOKEN_BYTES, SEALED_FLOW_TOKEN_BYTES,
    SEALED_SERVER_TOKEN_BYTES,
};
use magnetite::{FlowId, MAX_PACKET_SIZE, MTU};
use std::io;
use std::net::UdpSocket;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Packets delivered to the game per update.
const DELIVERY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerError {
    BadBindAddress,
    MissingKeypair,
    Io(io::ErrorKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ServerState {
    Stopped,
    Listening,
}

/// Names an active session slot from the game API without exposing the
/// flow id: an IPv4 of the shape `224.0.0.S` with the slot index as the
/// port and a per slot sequence byte that increments on reuse.
pub fn session_to_address(session_index: u16, session_sequence: u8) -> Address {
    Address::Ipv4 {
        ip: [224, 0, 0, session_sequence],
        port: session_index,
    }
}

/// Inverse of `session_to_address`. Recognizes exactly the synthetic shape.
pub fn session_from_address(address: &Address) -> Option<(u16, u8)> {
    match *address {
        Address::Ipv4 {
            ip: [224, 0, 0, sequence],
            port,
        } => Some((port, sequence)),
        _ => None,
    }
}

/// One installed route for a session. The server holds two of these per
/// session so that packets on either flow version keep flowing during a
/// migration transient.
#[derive(Clone)]
struct ServerRoute {
    packet_sequence: u64,
    replay_protection: ReplayProtection,
    kbps_up: u32,
    kbps_down: u32,
    prev_address: Address,
    flow_version: u8,
    flow_flags: u8,
    private_key: [u8; crypto::KEY_SIZE],
}

impl ServerRoute {
    fn zero() -> ServerRoute {
        ServerRoute {
            packet_sequence: 0,
            replay_protection: ReplayProtection::new(),
            kbps_up: 0,
            kbps_down: 0,
            prev_address: Address::None,
            flow_version: 0,
            flow_flags: 0,
            private_key: [0u8; crypto::KEY_SIZE],
        }
    }

    fn install(from: Address, token: &FlowToken) -> ServerRoute {
        ServerRoute {
            packet_sequence: 1,
            replay_protection: ReplayProtection::new(),
            kbps_up: token.kbps_up,
            kbps_down: token.kbps_down,
            prev_address: from,
            flow_version: token.flow_version,
            flow_flags: token.flow_flags,
            private_key: token.private_key,
        }
    }
}

/// One session slot. Flow id 0 marks the slot as empty.
struct Session {
    flow_id: FlowId,
    last_packet_receive_time: f64,
    route_current: ServerRoute,
    route_previous: ServerRoute,
    session_sequence: u8,
    backup_flow: bool,
}

impl Session {
    fn empty() -> Session {
        Session {
            flow_id: 0,
            last_packet_receive_time: 0.0,
            route_current: ServerRoute::zero(),
            route_previous: ServerRoute::zero(),
            session_sequence: 0,
            backup_flow: false,
        }
    }

    fn clear(&mut self) {
        let session_sequence = self.session_sequence;
        *self = Session::empty();
        // The sequence byte survives slot reuse so stale synthetic
        // addresses stop resolving.
        self.session_sequence = session_sequence;
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Which {
    Current,
    Previous,
}

struct DeliveredPacket {
    from_flow_id: FlowId,
    from_address: Address,
    length: usize,
    data: [u8; MAX_PACKET_SIZE],
}

impl DeliveredPacket {
    fn new(from_flow_id: FlowId, from_address: Address, payload: &[u8]) -> DeliveredPacket {
        let mut data = [0u8; MAX_PACKET_SIZE];
        data[..payload.len()].copy_from_slice(payload);

        DeliveredPacket {
            from_flow_id,
            from_address,
            length: payload.len(),
            data,
        }
    }

    fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

struct Core {
    state: ServerState,
    config: ServerConfig,
    sessions: Vec<Session>,
    delivery: Vec<DeliveredPacket>,
}

struct Inner {
    socket: UdpSocket,
    clock: Clock,
    master_public_key: [u8; crypto::BOX_PUBLIC_KEY_SIZE],
    log: Logger,
    core: Mutex<Core>,
}

/// The server side of the overlay: accepts route installs from the relay
/// chain, validates and delivers game payload, and replies through the
/// relay that last forwarded a valid packet for the flow.
pub struct Server {
    inner: Arc<Inner>,
    listen_thread: Option<thread::JoinHandle<()>>,
    on_packet: Box<dyn FnMut(FlowId, &Address, &[u8])>,
    delivery_scratch: Vec<DeliveredPacket>,
}

impl Server {
    /// Binds the server socket and starts the listener thread. The
    /// callback receives (flow id, reply address, payload) for every
    /// delivered game packet.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        runtime: &Runtime,
        config: ServerConfig,
        bind_address: &str,
        on_packet: Box<dyn FnMut(FlowId, &Address, &[u8])>,
        log: L,
    ) -> Result<Server, ServerError> {
        if !config.has_keypair() {
            return Err(ServerError::MissingKeypair);
        }

        let bind = Address::from_str(bind_address).map_err(|_| ServerError::BadBindAddress)?;
        let socket_addr = bind.to_socket_addr().ok_or(ServerError::BadBindAddress)?;

        let socket = UdpSocket::bind(socket_addr).map_err(|err| ServerError::Io(err.kind()))?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|err| ServerError::Io(err.kind()))?;

        let max_sessions = config.max_sessions;

        let mut sessions = Vec::with_capacity(max_sessions);
        for _ in 0..max_sessions {
            sessions.push(Session::empty());
        }

        let inner = Arc::new(Inner {
            socket,
            clock: runtime.clock().clone(),
            master_public_key: *runtime.master_public_key(),
            log: logging::component(log),
            core: Mutex::new(Core {
                state: ServerState::Listening,
                config,
                sessions,
                delivery: Vec::with_capacity(DELIVERY_QUEUE_CAPACITY),
            }),
        });

        let thread_inner = inner.clone();
        let listen_thread = thread::Builder::new()
            .name("server-listen".to_owned())
            .spawn(move || listen_loop(&thread_inner))
            .map_err(|err| ServerError::Io(err.kind()))?;

        logging::info!(inner.log, "server listening"; "bind" => bind_address);

        Ok(Server {
            inner,
            listen_thread: Some(listen_thread),
            on_packet,
            delivery_scratch: Vec::with_capacity(DELIVERY_QUEUE_CAPACITY),
        })
    }

    /// The local address the socket bound to. Useful when binding port 0.
    pub fn local_address(&self) -> Address {
        self.inner
            .socket
            .local_addr()
            .map(Address::from_socket_addr)
            .unwrap_or(Address::None)
    }

    pub fn public_key(&self) -> [u8; crypto::BOX_PUBLIC_KEY_SIZE] {
        let core = self.inner.core.lock().unwrap();
        *core.config.public_key
    }

    /// Drains delivered packets to the game callback and sweeps timed out
    /// sessions. Called from the game thread at its own cadence.
    pub fn update(&mut self) {
        let time = self.inner.clock.now();

        {
            let mut core = self.inner.core.lock().unwrap();

            std::mem::swap(&mut core.delivery, &mut self.delivery_scratch);

            check_for_timeouts(&self.inner, &mut core, time);
        }

        // Callbacks run outside the lock so the game is free to call the
        // send paths from inside them.
        for packet in &self.delivery_scratch {
            (self.on_packet)(packet.from_flow_id, &packet.from_address, packet.payload());
        }

        self.delivery_scratch.clear();
    }

    /// Sends game payload to a session. Backup sessions get the backup
    /// framing to their stored reply address; everything else gets an
    /// authenticated header and travels back through the relay that last
    /// forwarded a valid packet.
    pub fn send_to_session(&self, flow_id: FlowId, payload: &[u8]) {
        if payload.len() > MTU {
            logging::warn!(self.inner.log, "send to session dropped packet larger than MTU";
                           "bytes" => payload.len());
            return;
        }

        let direct = Address::from_direct_flow_id(flow_id);
        if !direct.is_none() {
            self.send_to_address(&direct, payload);
            return;
        }

        let mut core = self.inner.core.lock().unwrap();
        send_to_session_core(&self.inner, &mut core, flow_id, payload);
    }

    /// Sends game payload to an address. Synthetic session addresses route
    /// through the session send path; anything else is wrapped as a direct
    /// packet to the literal address.
    pub fn send_to_address(&self, address: &Address, payload: &[u8]) {
        if payload.len() > MTU {
            logging::warn!(self.inner.log, "send to address dropped packet larger than MTU";
                           "bytes" => payload.len());
            return;
        }

        if let Some((session_index, session_sequence)) = session_from_address(address) {
            let mut core = self.inner.core.lock().unwrap();

            let index = session_index as usize;
            if index < core.sessions.len()
                && core.sessions[index].flow_id != 0
                && core.sessions[index].session_sequence == session_sequence
            {
                let flow_id = core.sessions[index].flow_id;
                send_to_session_core(&self.inner, &mut core, flow_id, payload);
            }
            return;
        }

        let mut packet = Vec::with_capacity(1 + payload.len());
        packet.push(PacketType::Direct.into());
        packet.extend_from_slice(payload);

        send_packet(&self.inner, address, &packet);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        {
            let mut core = self.inner.core.lock().unwrap();
            core.state = ServerState::Stopped;
        }

        if let Some(thread) = self.listen_thread.take() {
            drop(thread.join());
        }
    }
}

fn listen_loop(inner: &Inner) {
    let mut buffer = [0u8; MAX_PACKET_SIZE];

    loop {
        let received = match inner.socket.recv_from(&mut buffer) {
            Ok((length, from)) => Some((length, Address::from_socket_addr(from))),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(_) => None,
        };

        let mut core = inner.core.lock().unwrap();

        if core.state == ServerState::Stopped {
            logging::info!(inner.log, "server listen thread stopped");
            break;
        }

        if let Some((length, from)) = received {
            process_packet(inner, &mut core, from, &buffer[..length]);
        }
    }
}

fn send_packet(inner: &Inner, to: &Address, packet: &[u8]) {
    if let Some(addr) = to.to_socket_addr() {
        drop(inner.socket.send_to(packet, addr));
    }
}

fn send_to_session_core(inner: &Inner, core: &mut Core, flow_id: FlowId, payload: &[u8]) {
    let index = match find_session(core, flow_id) {
        Some(index) => index,
        None => return,
    };

    if core.sessions[index].backup_flow {
        let mut packet = Vec::with_capacity(BACKUP_BYTES + payload.len());
        packet.push(PacketType::Backup.into());

        let mut flow_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut flow_bytes, flow_id);
        packet.extend_from_slice(&flow_bytes);
        packet.extend_from_slice(payload);

        let to = core.sessions[index].route_current.prev_address;
        send_packet(inner, &to, &packet);
        return;
    }

    let session = &mut core.sessions[index];
    let route = &mut session.route_current;

    let mut packet = vec![0u8; HEADER_BYTES + payload.len()];

    let head = Header {
        packet_type: PacketType::ServerToClient,
        sequence: route.packet_sequence,
        flow_id,
        flow_version: route.flow_version,
        flow_flags: route.flow_flags,
    };

    if header::write_header(&head, &route.private_key, &mut packet).is_err() {
        logging::error!(inner.log, "failed to write server to client header";
                        "flow_id" => format!("{:016x}", flow_id));
        return;
    }

    route.packet_sequence += 1;

    packet[HEADER_BYTES..].copy_from_slice(payload);

    let to = route.prev_address;
    send_packet(inner, &to, &packet);
}

fn find_session(core: &Core, flow_id: FlowId) -> Option<usize> {
    // Zero is the empty slot marker and never names a session.
    if flow_id == 0 {
        return None;
    }

    core.sessions.iter().position(|session| session.flow_id == flow_id)
}

fn find_free_session(core: &Core) -> Option<usize> {
    core.sessions.iter().position(|session| session.flow_id == 0)
}

fn add_session(core: &mut Core, from: Address, session_index: usize, token: &FlowToken, time: f64) {
    let session = &mut core.sessions[session_index];

    session.flow_id = token.flow_id;
    session.last_packet_receive_time = time;
    session.route_current = ServerRoute::install(from, token);
    session.route_previous = session.route_current.clone();
    session.backup_flow = false;
    session.session_sequence = session.session_sequence.wrapping_add(1);
}

fn update_session(core: &mut Core, from: Address, session_index: usize, token: &FlowToken) {
    let session = &mut core.sessions[session_index];

    session.route_previous = session.route_current.clone();

    session.route_current.flow_version = token.flow_version;
    session.route_current.flow_flags = token.flow_flags;
    session.route_current.packet_sequence = 1;
    session.route_current.prev_address = from;
    session.route_current.private_key = token.private_key;
    session.route_current.replay_protection.reset();
}

fn remove_session(core: &mut Core, session_index: usize) {
    core.sessions[session_index].clear();
}

/// Locates the session and route matching the packet's peeked header.
fn session_for_packet(inner: &Inner, core: &Core, packet: &[u8]) -> Option<(usize, Which)> {
    let head = match header::peek_header(packet) {
        Ok(head) => head,
        Err(err) => {
            logging::debug!(inner.log, "server ignored packet"; "reason" => "failed to peek header",
                            "error" => ?err);
            return None;
        }
    };

    let session_index = match find_session(core, head.flow_id) {
        Some(index) => index,
        None => {
            logging::debug!(inner.log, "server ignored packet"; "reason" => "could not find session",
                            "flow_id" => format!("{:016x}", head.flow_id));
            return None;
        }
    };

    let session = &core.sessions[session_index];

    if head.flow_version == session.route_current.flow_version {
        Some((session_index, Which::Current))
    } else if head.flow_version == session.route_previous.flow_version {
        Some((session_index, Which::Previous))
    } else {
        logging::debug!(inner.log, "server ignored packet"; "reason" => "flow version mismatch",
                        "flow_version" => head.flow_version);
        None
    }
}

/// Authenticates the packet against the route, applies replay protection
/// and records the forwarding relay as the reply address.
fn route_process_packet(
    inner: &Inner,
    route: &mut ServerRoute,
    from: Address,
    packet: &[u8],
) -> Option<Header> {
    let head = match header::read_header(&route.private_key, packet) {
        Ok(head) => head,
        Err(err) => {
            logging::debug!(inner.log, "server ignored packet"; "reason" => "failed to read header",
                            "error" => ?err);
            return None;
        }
    };

    if head.flow_version != route.flow_version {
        logging::debug!(inner.log, "server ignored packet"; "reason" => "flow version mismatch");
        return None;
    }

    if route.replay_protection.already_received(head.sequence) {
        logging::debug!(inner.log, "server ignored packet"; "reason" => "already received",
                        "sequence" => head.sequence);
        return None;
    }

    route.prev_address = from;

    Some(head)
}

fn process_packet(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.is_empty() {
        return;
    }

    match PacketType::from_u8(packet[0]) {
        Some(PacketType::RouteRequest) => process_route_request(inner, core, from, packet),
        Some(PacketType::ContinueRequest) => process_continue_request(inner, core, from, packet),
        Some(PacketType::ClientToServer) => process_client_to_server(inner, core, from, packet),
        Some(PacketType::Migrate) => process_migrate(inner, core, from, packet),
        Some(PacketType::Destroy) => process_destroy(inner, core, from, packet),
        Some(PacketType::Backup) => process_backup(inner, core, from, packet),
        Some(PacketType::Direct) => process_direct(inner, core, from, packet),
        Some(PacketType::DirectServerPing) => process_direct_server_ping(inner, from, packet),
        Some(PacketType::RelayServerPing) => process_relay_server_ping(inner, core, from, packet),
        _ => {}
    }
}

fn process_route_request(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() != 1 + SEALED_FLOW_TOKEN_BYTES {
        logging::error!(inner.log, "server ignored route request packet"; "reason" => "incorrect packet size",
                        "expected" => 1 + SEALED_FLOW_TOKEN_BYTES, "got" => packet.len());
        return;
    }

    let mut cursor = &packet[1..];
    let private_key = *core.config.private_key;

    let token = match FlowToken::read_sealed(&mut cursor, &inner.master_public_key, &private_key) {
        Ok(token) => token,
        Err(_) => {
            logging::error!(inner.log, "server ignored route request packet";
                            "reason" => "could not read encrypted token");
            return;
        }
    };

    if token.flow_id == 0 {
        logging::debug!(inner.log, "server ignored route request packet"; "reason" => "zero flow id");
        return;
    }

    let flow_log = logging::flow(&inner.log, token.flow_id, token.flow_version);

    let session_index = match find_session(core, token.flow_id) {
        Some(session_index) => {
            if sequence_greater_than(
                token.flow_version,
                core.sessions[session_index].route_current.flow_version,
            ) {
                update_session(core, from, session_index, &token);
            }
            session_index
        }
        None => {
            let session_index = match find_free_session(core) {
                Some(session_index) => session_index,
                None => {
                    logging::error!(inner.log, "server ignored route request packet";
                                    "reason" => "no free sessions");
                    return;
                }
            };

            logging::info!(flow_log, "session created");

            add_session(core, from, session_index, &token, inner.clock.now());
            session_index
        }
    };

    let sequence = core.sessions[session_index].route_current.packet_sequence;
    core.sessions[session_index].route_current.packet_sequence += 1;

    let mut response = vec![0u8; HEADER_BYTES];

    let head = Header {
        packet_type: PacketType::RouteResponse,
        sequence,
        flow_id: token.flow_id,
        flow_version: token.flow_version,
        flow_flags: token.flow_flags,
    };

    if header::write_header(&head, &token.private_key, &mut response).is_err() {
        logging::error!(flow_log, "failed to write route response header");
        return;
    }

    let server_token = ServerToken {
        expire_timestamp: token.expire_timestamp,
        flow_id: token.flow_id,
        flow_version: token.flow_version,
        flow_flags: token.flow_flags,
    };

    if server_token
        .write_sealed(&private_key, &inner.master_public_key, &mut response)
        .is_err()
    {
        logging::error!(flow_log, "failed to write encrypted server token");
        return;
    }

    logging::debug!(flow_log, "server received route request packet");

    send_packet(inner, &from, &response);
}

fn process_continue_request(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() != 1 + SEALED_CONTINUE_TOKEN_BYTES {
        logging::error!(inner.log, "server ignored continue request packet"; "reason" => "incorrect packet size",
                        "expected" => 1 + SEALED_CONTINUE_TOKEN_BYTES, "got" => packet.len());
        return;
    }

    let mut cursor = &packet[1..];
    let private_key = *core.config.private_key;

    let token = match ContinueToken::read_sealed(&mut cursor, &inner.master_public_key, &private_key)
    {
        Ok(token) => token,
        Err(_) => {
            logging::error!(inner.log, "server ignored continue request packet";
                            "reason" => "could not read encrypted token");
            return;
        }
    };

    let flow_log = logging::flow(&inner.log, token.flow_id, token.flow_version);

    let session_index = match find_session(core, token.flow_id) {
        Some(session_index) => session_index,
        None => {
            logging::error!(flow_log, "server ignored continue request packet";
                            "reason" => "could not find session to continue");
            return;
        }
    };

    let sequence = core.sessions[session_index].route_current.packet_sequence;
    core.sessions[session_index].route_current.packet_sequence += 1;

    let mut response = vec![0u8; HEADER_BYTES];

    let head = Header {
        packet_type: PacketType::ContinueResponse,
        sequence,
        flow_id: token.flow_id,
        flow_version: token.flow_version,
        flow_flags: token.flow_flags,
    };

    let response_key = core.sessions[session_index].route_current.private_key;
    if header::write_header(&head, &response_key, &mut response).is_err() {
        logging::error!(flow_log, "failed to write continue response header");
        return;
    }

    let server_token = ServerToken {
        expire_timestamp: token.expire_timestamp,
        flow_id: token.flow_id,
        flow_version: token.flow_version,
        flow_flags: token.flow_flags,
    };

    if server_token
        .write_sealed(&private_key, &inner.master_public_key, &mut response)
        .is_err()
    {
        logging::error!(flow_log, "failed to write encrypted server token");
        return;
    }

    logging::debug!(flow_log, "server received continue request packet");

    send_packet(inner, &from, &response);
}

fn process_client_to_server(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() < HEADER_BYTES {
        logging::warn!(inner.log, "server ignored client to server packet"; "reason" => "too small",
                       "bytes" => packet.len());
        return;
    }

    let (session_index, which) = match session_for_packet(inner, core, packet) {
        Some(found) => found,
        None => return,
    };

    let session = &mut core.sessions[session_index];
    let route = match which {
        Which::Current => &mut session.route_current,
        Which::Previous => &mut session.route_previous,
    };

    if route_process_packet(inner, route, from, packet).is_none() {
        return;
    }

    session.last_packet_receive_time = inner.clock.now();

    let session_address = session_to_address(session_index as u16, session.session_sequence);
    let flow_id = session.flow_id;

    core.delivery.push(DeliveredPacket::new(
        flow_id,
        session_address,
        &packet[HEADER_BYTES..],
    ));
}

fn process_migrate(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() != HEADER_BYTES {
        logging::error!(inner.log, "server ignored migrate packet"; "reason" => "incorrect packet size",
                        "got" => packet.len());
        return;
    }

    let (session_index, which) = match session_for_packet(inner, core, packet) {
        Some(found) => found,
        None => return,
    };

    // Migrate only ever validates against the route being left behind.
    if which != Which::Previous {
        return;
    }

    let session = &mut core.sessions[session_index];

    if route_process_packet(inner, &mut session.route_previous, from, packet).is_none() {
        return;
    }

    let route = &mut session.route_previous;

    let mut response = vec![0u8; HEADER_BYTES];

    let head = Header {
        packet_type: PacketType::MigrateResponse,
        sequence: route.packet_sequence,
        flow_id: session.flow_id,
        flow_version: route.flow_version,
        flow_flags: route.flow_flags,
    };

    if header::write_header(&head, &route.private_key, &mut response).is_err() {
        logging::error!(inner.log, "failed to write migrate response header";
                        "flow_id" => format!("{:016x}", session.flow_id));
        return;
    }

    route.packet_sequence += 1;

    logging::debug!(logging::flow(&inner.log, session.flow_id, route.flow_version),
                    "server received migrate packet");

    let to = route.prev_address;
    send_packet(inner, &to, &response);
}

fn process_destroy(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() != HEADER_BYTES {
        logging::error!(inner.log, "server ignored destroy packet"; "reason" => "incorrect packet size",
                        "got" => packet.len());
        return;
    }

    let (session_index, which) = match session_for_packet(inner, core, packet) {
        Some(found) => found,
        None => return,
    };

    if which != Which::Current {
        return;
    }

    let session = &mut core.sessions[session_index];

    if route_process_packet(inner, &mut session.route_current, from, packet).is_none() {
        return;
    }

    logging::info!(logging::flow(&inner.log, session.flow_id, session.route_current.flow_version),
                   "session destroyed");

    remove_session(core, session_index);
}

fn process_backup(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() < BACKUP_BYTES {
        logging::debug!(inner.log, "server ignored backup packet"; "reason" => "too small");
        return;
    }

    let flow_id = LittleEndian::read_u64(&packet[1..9]);

    let session_index = match find_session(core, flow_id) {
        Some(session_index) => session_index,
        None => {
            logging::debug!(inner.log, "server ignored backup packet"; "reason" => "could not find session",
                            "flow_id" => format!("{:016x}", flow_id));
            return;
        }
    };

    let session = &mut core.sessions[session_index];

    if !session.backup_flow {
        session.backup_flow = true;
        session.route_current.prev_address = from;
        logging::info!(logging::flow(&inner.log, session.flow_id, session.route_current.flow_version),
                       "session fell to backup flow");
    }

    session.last_packet_receive_time = inner.clock.now();

    core.delivery.push(DeliveredPacket::new(flow_id, from, &packet[BACKUP_BYTES..]));
}

fn process_direct(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() == 1 {
        logging::warn!(inner.log, "server ignored direct packet"; "reason" => "too small");
        return;
    }

    let flow_id = from.to_direct_flow_id();
    if flow_id == 0 {
        logging::debug!(inner.log, "server ignored direct packet"; "reason" => "sender has no flow id form");
        return;
    }

    core.delivery.push(DeliveredPacket::new(flow_id, from, &packet[1..]));
}

fn process_direct_server_ping(inner: &Inner, from: Address, packet: &[u8]) {
    if packet.len() != PING_PONG_BYTES {
        logging::warn!(inner.log, "server ignored direct server ping"; "reason" => "incorrect packet size",
                       "expected" => PING_PONG_BYTES, "got" => packet.len());
        return;
    }

    let (flow_id, sequence) = match header::read_ping(packet) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };

    let response = header::write_ping(PacketType::DirectServerPong, flow_id, sequence);

    send_packet(inner, &from, &response);
}

fn process_relay_server_ping(inner: &Inner, core: &mut Core, from: Address, packet: &[u8]) {
    if packet.len() != HEADER_BYTES + PING_PONG_BYTES {
        logging::warn!(inner.log, "server ignored relay server ping packet"; "reason" => "incorrect packet size",
                       "expected" => HEADER_BYTES + PING_PONG_BYTES, "got" => packet.len());
        return;
    }

    let (session_index, which) = match session_for_packet(inner, core, packet) {
        Some(found) => found,
        None => return,
    };

    let session = &mut core.sessions[session_index];
    let route = match which {
        Which::Current => &mut session.route_current,
        Which::Previous => &mut session.route_previous,
    };

    if route_process_packet(inner, route, from, packet).is_none() {
        return;
    }

    let (ping_flow_id, ping_sequence) = match header::read_ping_body(&packet[HEADER_BYTES..]) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };

    let mut response = vec![0u8; HEADER_BYTES + PING_PONG_BYTES];

    let head = Header {
        packet_type: PacketType::RelayServerPong,
        sequence: route.packet_sequence,
        flow_id: session.flow_id,
        flow_version: route.flow_version,
        flow_flags: route.flow_flags,
    };

    if header::write_header(&head, &route.private_key, &mut response).is_err() {
        logging::error!(inner.log, "failed to write relay server pong header";
                        "flow_id" => format!("{:016x}", session.flow_id));
        return;
    }

    route.packet_sequence += 1;

    if header::write_ping_body(ping_flow_id, ping_sequence, &mut response[HEADER_BYTES..]).is_err() {
        return;
    }

    session.last_packet_receive_time = inner.clock.now();

    logging::debug!(logging::flow(&inner.log, session.flow_id, route.flow_version),
                    "server received relay server ping packet");

    let to = route.prev_address;
    send_packet(inner, &to, &response);
}

fn check_for_timeouts(inner: &Inner, core: &mut Core, time: f64) {
    let timeout = core.config.session_timeout_secs;

    for session_index in 0..core.sessions.len() {
        let session = &core.sessions[session_index];

        if session.flow_id == 0 {
            continue;
        }

        if session.last_packet_receive_time + timeout < time {
            logging::warn!(logging::flow(&inner.log, session.flow_id, session.route_current.flow_version),
                           "session timed out");
            remove_session(core, session_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use magnetite::time::timestamp_secs;

    fn bind_socket() -> (UdpSocket, Address) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let address = Address::from_socket_addr(socket.local_addr().unwrap());
        (socket, address)
    }

    fn recv_packet(socket: &UdpSocket) -> Option<Vec<u8>> {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        match socket.recv_from(&mut buffer) {
            Ok((length, _)) => Some(buffer[..length].to_vec()),
            Err(_) => None,
        }
    }

    fn send_to(socket: &UdpSocket, to: &Address, packet: &[u8]) {
        socket.send_to(packet, to.to_socket_addr().unwrap()).unwrap();
    }

    struct Harness {
        server: Server,
        server_address: Address,
        master_private: [u8; 32],
        server_public: [u8; 32],
        delivered: Arc<Mutex<Vec<(FlowId, Address, Vec<u8>)>>>,
    }

    fn make_harness(session_timeout_secs: f64) -> Harness {
        let (master_public, master_private) = crypto::generate_keypair();
        let runtime = Runtime::new("http://localhost", master_public, None);

        let (server_public, server_private) = crypto::generate_keypair();

        let mut config = ServerConfig::new(server_public, server_private);
        config.session_timeout_secs = session_timeout_secs;

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();

        let server = Server::new(
            &runtime,
            config,
            "127.0.0.1:0",
            Box::new(move |flow_id: FlowId, address: &Address, payload: &[u8]| {
                sink.lock().unwrap().push((flow_id, *address, payload.to_vec()));
            }),
            None,
        )
        .unwrap();

        let server_address = server.local_address();

        Harness {
            server,
            server_address,
            master_private,
            server_public,
            delivered,
        }
    }

    /// Sends a route request for a fresh flow from the given socket and
    /// returns the server's route response bytes.
    fn install_session(
        harness: &Harness,
        socket: &UdpSocket,
        flow_id: u64,
        flow_version: u8,
        key: [u8; crypto::KEY_SIZE],
    ) -> Vec<u8> {
        let token = FlowToken {
            expire_timestamp: timestamp_secs() + 3600,
            flow_id,
            flow_version,
            flow_flags: 0,
            kbps_up: 256,
            kbps_down: 256,
            next_address: Address::None,
            private_key: key,
        };

        let mut packet = vec![u8::from(PacketType::RouteRequest)];
        token
            .write_sealed(&harness.master_private, &harness.server_public, &mut packet)
            .unwrap();

        send_to(socket, &harness.server_address, &packet);

        recv_packet(socket).expect("no route response")
    }

    fn client_to_server_packet(
        flow_id: u64,
        flow_version: u8,
        key: &[u8; crypto::KEY_SIZE],
        sequence: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_BYTES + payload.len()];

        let head = Header {
            packet_type: PacketType::ClientToServer,
            sequence,
            flow_id,
            flow_version,
            flow_flags: 0,
        };

        header::write_header(&head, key, &mut packet).unwrap();
        packet[HEADER_BYTES..].copy_from_slice(payload);

        packet
    }

    #[test]
    fn test_route_request_creates_session_and_responds() {
        magnetite::crypto::init();

        let harness = make_harness(10.0);
        let (socket, _) = bind_socket();

        let key = crypto::random_key();
        let response = install_session(&harness, &socket, 0x77, 1, key);

        assert_eq!(response.len(), HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES);

        let head = header::read_header(&key, &response).unwrap();
        assert_eq!(head.packet_type, PacketType::RouteResponse);
        assert_eq!(head.flow_id, 0x77);
        assert_eq!(head.flow_version, 1);
    }

    #[test]
    fn test_client_to_server_delivery_and_replay_drop() {
        magnetite::crypto::init();

        let mut harness = make_harness(10.0);
        let (socket, _) = bind_socket();

        let key = crypto::random_key();
        install_session(&harness, &socket, 0x42, 1, key);

        let packet = client_to_server_packet(0x42, 1, &key, 42, &[0xAB, 0xCD]);

        // The exact same bytes twice; only the first copy may be delivered.
        send_to(&socket, &harness.server_address, &packet);
        send_to(&socket, &harness.server_address, &packet);

        for _ in 0..100 {
            harness.server.update();
            if !harness.delivered.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        // Let the duplicate settle before the final count.
        thread::sleep(Duration::from_millis(50));
        harness.server.update();

        let delivered = harness.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);

        let (flow_id, address, payload) = &delivered[0];
        assert_eq!(*flow_id, 0x42);
        assert_eq!(payload, &vec![0xAB, 0xCD]);

        // Delivery names the session with the synthetic address shape.
        assert!(session_from_address(address).is_some());
    }

    #[test]
    fn test_session_timeout_frees_slot() {
        magnetite::crypto::init();

        let mut harness = make_harness(0.3);
        let (socket, _) = bind_socket();

        let key = crypto::random_key();
        install_session(&harness, &socket, 0x55, 1, key);

        thread::sleep(Duration::from_millis(500));
        harness.server.update();

        // The slot is gone; packets on the old flow are dropped.
        let packet = client_to_server_packet(0x55, 1, &key, 1, &[0x01]);
        send_to(&socket, &harness.server_address, &packet);

        thread::sleep(Duration::from_millis(100));
        harness.server.update();

        assert!(harness.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_destroy_removes_session() {
        magnetite::crypto::init();

        let mut harness = make_harness(10.0);
        let (socket, _) = bind_socket();

        let key = crypto::random_key();
        install_session(&harness, &socket, 0x66, 1, key);

        let mut destroy = vec![0u8; HEADER_BYTES];
        let head = Header {
            packet_type: PacketType::Destroy,
            sequence: 1,
            flow_id: 0x66,
            flow_version: 1,
            flow_flags: 0,
        };
        header::write_header(&head, &key, &mut destroy).unwrap();

        send_to(&socket, &harness.server_address, &destroy);
        thread::sleep(Duration::from_millis(100));

        let packet = client_to_server_packet(0x66, 1, &key, 2, &[0x01]);
        send_to(&socket, &harness.server_address, &packet);

        thread::sleep(Duration::from_millis(100));
        harness.server.update();

        assert!(harness.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_migrate_validates_against_previous_route() {
        magnetite::crypto::init();

        let harness = make_harness(10.0);
        let (socket, _) = bind_socket();

        let key_v1 = crypto::random_key();
        let key_v2 = crypto::random_key();

        install_session(&harness, &socket, 0x88, 1, key_v1);
        install_session(&harness, &socket, 0x88, 2, key_v2);

        // Migrate under the version being left behind.
        let mut migrate = vec![0u8; HEADER_BYTES];
        let head = Header {
            packet_type: PacketType::Migrate,
            sequence: 5,
            flow_id: 0x88,
            flow_version: 1,
            flow_flags: 0,
        };
        header::write_header(&head, &key_v1, &mut migrate).unwrap();

        send_to(&socket, &harness.server_address, &migrate);

        let response = recv_packet(&socket).expect("no migrate response");
        let head = header::read_header(&key_v1, &response).unwrap();
        assert_eq!(head.packet_type, PacketType::MigrateResponse);
        assert_eq!(head.flow_version, 1);
    }

    #[test]
    fn test_direct_server_ping_pong() {
        magnetite::crypto::init();

        let harness = make_harness(10.0);
        let (socket, _) = bind_socket();

        let ping = header::write_ping(PacketType::DirectServerPing, 0x99, 1234);
        send_to(&socket, &harness.server_address, &ping);

        let pong = recv_packet(&socket).expect("no pong");
        assert_eq!(pong[0], u8::from(PacketType::DirectServerPong));
        assert_eq!(header::read_ping(&pong).unwrap(), (0x99, 1234));
    }

    #[test]
    fn test_backup_flow_marks_session_and_replies_direct() {
        magnetite::crypto::init();

        let mut harness = make_harness(10.0);
        let (socket, socket_address) = bind_socket();

        let key = crypto::random_key();
        install_session(&harness, &socket, 0xAA, 1, key);

        // Backup framing carries no header; the flow id alone names the
        // session.
        let mut backup = vec![u8::from(PacketType::Backup)];
        let mut flow_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut flow_bytes, 0xAA);
        backup.extend_from_slice(&flow_bytes);
        backup.push(0x33);

        send_to(&socket, &harness.server_address, &backup);

        for _ in 0..100 {
            harness.server.update();
            if !harness.delivered.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        {
            let delivered = harness.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].0, 0xAA);
            assert_eq!(delivered[0].1, socket_address);
            assert_eq!(delivered[0].2, vec![0x33]);
        }

        // Replies now take the backup framing to the recorded address.
        harness.server.send_to_session(0xAA, &[0x44]);

        let reply = recv_packet(&socket).expect("no backup reply");
        assert_eq!(reply[0], u8::from(PacketType::Backup));
        assert_eq!(LittleEndian::read_u64(&reply[1..9]), 0xAA);
        assert_eq!(&reply[BACKUP_BYTES..], &[0x44]);
    }

    #[test]
    fn test_send_to_address_wraps_direct_peers() {
        magnetite::crypto::init();

        let harness = make_harness(10.0);
        let (socket, socket_address) = bind_socket();

        harness.server.send_to_address(&socket_address, &[0x11, 0x22]);

        assert_eq!(recv_packet(&socket).unwrap(), vec![0x00, 0x11, 0x22]);

        // The direct flow id encoding reaches the same peer through the
        // session send path.
        let flow_id = socket_address.to_direct_flow_id();
        harness.server.send_to_session(flow_id, &[0x33]);

        assert_eq!(recv_packet(&socket).unwrap(), vec![0x00, 0x33]);
    }

    #[test]
    fn test_session_address_roundtrip() {
        for &(index, sequence) in &[(0u16, 0u8), (1, 1), (255, 7), (65535, 255)] {
            let address = session_to_address(index, sequence);
            assert_eq!(session_from_address(&address), Some((index, sequence)));
        }
    }

    #[test]
    fn test_session_address_rejects_other_shapes() {
        let address = Address::Ipv4 {
            ip: [10, 0, 0, 1],
            port: 5000,
        };
        assert_eq!(session_from_address(&address), None);
        assert_eq!(session_from_address(&Address::None), None);
    }

    #[test]
    fn test_session_clear_keeps_sequence() {
        let mut session = Session::empty();
        session.flow_id = 42;
        session.session_sequence = 7;
        session.backup_flow = true;

        session.clear();

        assert_eq!(session.flow_id, 0);
        assert_eq!(session.session_sequence, 7);
        assert!(!session.backup_flow);
    }
}
