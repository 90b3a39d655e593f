use crate::config::ClientConfig;
use crate::controller::{
    self, ClientInfo, Controller, ControllerEvent, InitialRouteRequest, NearRelay, RelayStat,
    RouteUpdateRequest, RouteUpdateResponse, CounterUpload,
    HTTP_TIMEOUT_COUNTERS_MS, HTTP_TIMEOUT_INITIAL_ROUTE_MS, HTTP_TIMEOUT_NEAR_RELAYS_MS,
    HTTP_TIMEOUT_ROUTE_UPDATE_MS, ROUTER_ROUTE_PATH, ROUTER_UPDATE_PATH, STATS_COUNTERS_PATH,
};
use crate::ping::{PingHistory, RouteStats, StatsHistory, StatsSample};
use crate::queue::{DoubleBuffer, IncomingPacket, PacketQueue};
use crate::runtime::Runtime;
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use magnetite::address::Address;
use magnetite::crypto;
use magnetite::header::{self, Header, PacketType, BACKUP_BYTES, HEADER_BYTES, PING_PONG_BYTES};
use magnetite::logging::{self, Logger};
use magnetite::prefix::RoutePrefix;
use magnetite::time::Clock;
use magnetite::token::{
    ContinueToken, FlowToken, SEALED_CONTINUE_TOKEN_BYTES, SEALED_FLOW_TOKEN_BYTES,
    SEALED_SERVER_TOKEN_BYTES,
};
use magnetite::{FlowId, MAX_PACKET_SIZE, MTU};
use std::io;
use std::mem;
use std::net::UdpSocket;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Client lifecycle. Ordering matters: the comparisons mirror the
/// progression from stopped through located to established.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ClientState {
    Stopped,
    Locating,
    Ready,
    InsecureRequesting,
    Requesting,
    Established,
    Direct,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientMode {
    Auto,
    ForceDirect,
    ForceRelay,
}

impl ClientMode {
    fn value(self) -> i32 {
        match self {
            ClientMode::Auto => 0,
            ClientMode::ForceDirect => 1,
            ClientMode::ForceRelay => 2,
        }
    }
}

/// Errors surfaced through `Client::error`. The data plane itself never
/// fails a call on remote input; these describe API misuse and control
/// plane breakdowns.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientError {
    InvalidParameter,
    InsecureSessionFailed,
    FailedToLocate,
    InvalidRoute,
    BadServerAddress,
    RouteTimedOut,
    TimedOut,
    RelayOnly,
}

/// Client side counters uploaded to the controller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(usize)]
pub enum Counter {
    NoNearRelays = 0,
    OpenSession = 1,
    OpenSessionDirect = 2,
    CloseSession = 3,
    FallbackToDirect = 4,
    CantBeatDirect = 5,
    RouteUpdateTimeout = 6,
    ServerToClientTimeout = 7,
}

pub const COUNTER_COUNT: usize = 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RouteRequestSending {
    Inactive,
    Initial,
    Update,
    Continue,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HttpRequestSending {
    Inactive,
    Near,
    RouteUpdate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WhichRoute {
    Current,
    Previous,
}

/// One installed route from the client's perspective. The client holds
/// two so that packets authenticated under either flow version keep
/// being accepted during a migration transient.
#[derive(Clone)]
struct ClientRoute {
    flow_token: FlowToken,
    sequence: u64,
    time_last_packet_received: f64,
    replay_protection: magnetite::replay::ReplayProtection,
    ping_history_server: PingHistory,
    route_relay_count: u32,
}

impl ClientRoute {
    fn zero() -> ClientRoute {
        ClientRoute {
            flow_token: FlowToken::zero(),
            sequence: 0,
            time_last_packet_received: 0.0,
            replay_protection: magnetite::replay::ReplayProtection::new(),
            ping_history_server: PingHistory::new(),
            route_relay_count: 0,
        }
    }

    fn reset(&mut self) {
        *self = ClientRoute::zero();
    }
}

/// Selects the route outgoing packets must use. While a route install
/// response is outstanding the previous route carries traffic, so that
/// in-flight packets during a migration use keys the server still
/// accepts.
fn send_route<'a>(
    sending: RouteRequestSending,
    current: &'a mut ClientRoute,
    previous: &'a mut ClientRoute,
) -> &'a mut ClientRoute {
    match sending {
        RouteRequestSending::Initial | RouteRequestSending::Update => previous,
        _ => current,
    }
}

struct RelayPingHistory {
    address: Address,
    history: PingHistory,
}

/// Fields shared with the listener thread, guarded by one mutex. The
/// listener checks the state word each loop and appends captured packets
/// to the active queue half.
struct ListenShared {
    state: ClientState,
    queues: DoubleBuffer,
}

/// Session data for an insecure (development) session opened without a
/// backend matchmaker. The request is signed with the customer key.
pub struct InsecureSessionData {
    pub customer_id: u64,
    pub customer_private_key: [u8; crypto::SIGN_SECRET_KEY_SIZE],
    pub server_public_key_base64: String,
    pub server_address: String,
    pub max_price_per_gig: Option<String>,
    pub direct_price_per_gig: Option<String>,
    pub user_id: u64,
    pub dest_relay: u64,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub acceptable_latency: f32,
    pub acceptable_jitter: f32,
    pub acceptable_packet_loss: f32,
    pub platform_id: u8,
}

/// Snapshot of the client's path statistics for the game UI.
pub struct ClientStats {
    pub relay: RouteStats,
    pub direct: RouteStats,
    pub samples: Vec<StatsSample>,
}

pub struct NearRelayStat {
    pub id: u64,
    pub rtt: f32,
}

/// The client half of the overlay. Opens sessions over a relay chain or
/// directly, keeps measuring both paths, migrates between relay chains on
/// controller instruction and falls back to the direct path when the
/// relay path stops earning its keep.
pub struct Client {
    config: ClientConfig,
    controller: Box<dyn Controller>,
    clock: Clock,
    log: Logger,
    master_public_key: [u8; crypto::BOX_PUBLIC_KEY_SIZE],

    mode: ClientMode,
    error: Option<ClientError>,

    route_current: ClientRoute,
    route_previous: ClientRoute,
    server_address: Address,

    route_request: Vec<u8>,
    route_state: Vec<u8>,
    server_token: [u8; SEALED_SERVER_TOKEN_BYTES],
    route_request_sending: RouteRequestSending,
    http_request_sending: HttpRequestSending,
    migrate_packet_sending: bool,
    backup_flow: bool,
    force_route: bool,

    route_request_last: f64,
    migrate_packet_last: f64,
    ping_relays_last: f64,
    route_update_next: f64,
    route_update_last: f64,
    route_changed_last: f64,
    near_update_last: f64,
    counter_check_last: f64,
    counter_post_last: f64,
    last_server_ping: f64,
    last_stats_sample: f64,

    relay_rtt_worse_than_direct_count: u32,
    locating_retries: u32,

    near_relays: Vec<NearRelay>,
    relay_ping_history: HashMap<u64, RelayPingHistory>,
    public_ip: Address,
    override_location: Option<(f32, f32)>,

    public_key: [u8; crypto::BOX_PUBLIC_KEY_SIZE],
    private_key: [u8; crypto::BOX_SECRET_KEY_SIZE],

    direct_ping_history: PingHistory,
    stats_history: StatsHistory,

    counters: [u64; COUNTER_COUNT],

    socket: UdpSocket,
    shared: Arc<Mutex<ListenShared>>,
    listen_thread: Option<thread::JoinHandle<()>>,
    scratch: PacketQueue,
    on_packet: Box<dyn FnMut(&[u8])>,
}

impl Client {
    const RECV_TIMEOUT: Duration = Duration::from_millis(100);
    const QUEUE_CAPACITY: usize = 1024;

    const PING_RELAYS_INTERVAL: f64 = 0.1;
    const PING_SERVER_INTERVAL: f64 = 0.1;
    const SAMPLE_STATS_INTERVAL: f64 = 1.0;
    const STATS_WINDOW: f64 = 5.0;
    const RESEND_INTERVAL: f64 = 0.1;

    const LATENCY_THRESHOLD: f32 = 1.0;
    const MAX_LATENCY_FAILURES: u32 = 25;

    const MIGRATE_PACKET_SEND_COUNT: u32 = 10;
    const DESTROY_PACKET_SEND_COUNT: u32 = 10;

    /// Route updates are requested once per billing slice.
    const BILLING_SLICE_SECS: f64 = 10.0;
    const ROUTE_UPDATE_MIN_SPACING: f64 = 1.0;
    const ROUTE_UPDATE_GRACE_SECS: f64 = 5.0;

    const NEAR_REFRESH_SECS: f64 = 10.0;
    const LOCATING_RETRY_SECS: f64 = 1.0;
    const LOCATING_MAX_RETRIES: u32 = 4;
    const LOCATING_SETTLE_SECS: f64 = 2.0;

    const COUNTER_CHECK_SECS: f64 = 1.0;
    const COUNTER_POST_SECS: f64 = 10.0;

    /// The freshly installed route needs this long of ping history before
    /// its statistics are trusted over the previous route's.
    const ROUTE_STATS_SETTLE_SECS: f64 = 2.0;

    const MAX_RELAY_HISTORIES: usize = controller::MAX_NEAR_RELAYS * 2;

    /// Binds the client socket and starts the listener thread. The
    /// callback receives every delivered game payload.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        runtime: &Runtime,
        config: ClientConfig,
        controller: Box<dyn Controller>,
        on_packet: Box<dyn FnMut(&[u8])>,
        log: L,
    ) -> io::Result<Client> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(Self::RECV_TIMEOUT))?;

        let listen_socket = socket.try_clone()?;

        let (public_key, private_key) = crypto::generate_keypair();

        let initial_state = if config.direct_only {
            ClientState::Ready
        } else {
            ClientState::Locating
        };

        let shared = Arc::new(Mutex::new(ListenShared {
            state: initial_state,
            queues: DoubleBuffer::new(Self::QUEUE_CAPACITY),
        }));

        let log = logging::component(log);

        let thread_shared = shared.clone();
        let thread_clock = runtime.clock().clone();
        let thread_log = log.new(logging::o!());
        let listen_thread = thread::Builder::new()
            .name("client-listen".to_owned())
            .spawn(move || listen_loop(listen_socket, thread_shared, thread_clock, thread_log))?;

        Ok(Client {
            config,
            controller,
            clock: runtime.clock().clone(),
            log,
            master_public_key: *runtime.master_public_key(),
            mode: ClientMode::Auto,
            error: None,
            route_current: ClientRoute::zero(),
            route_previous: ClientRoute::zero(),
            server_address: Address::None,
            route_request: Vec::new(),
            route_state: Vec::new(),
            server_token: [0u8; SEALED_SERVER_TOKEN_BYTES],
            route_request_sending: RouteRequestSending::Inactive,
            http_request_sending: HttpRequestSending::Inactive,
            migrate_packet_sending: false,
            backup_flow: false,
            force_route: false,
            route_request_last: 0.0,
            migrate_packet_last: 0.0,
            ping_relays_last: 0.0,
            route_update_next: 0.0,
            route_update_last: 0.0,
            route_changed_last: 0.0,
            near_update_last: -100.0,
            counter_check_last: 0.0,
            counter_post_last: -100.0,
            last_server_ping: 0.0,
            last_stats_sample: 0.0,
            relay_rtt_worse_than_direct_count: 0,
            locating_retries: 0,
            near_relays: Vec::new(),
            relay_ping_history: HashMap::new(),
            public_ip: Address::None,
            override_location: None,
            public_key,
            private_key,
            direct_ping_history: PingHistory::new(),
            stats_history: StatsHistory::new(),
            counters: [0u64; COUNTER_COUNT],
            socket,
            shared,
            listen_thread: Some(listen_thread),
            scratch: PacketQueue::new(Self::QUEUE_CAPACITY),
            on_packet,
        })
    }

    pub fn state(&self) -> ClientState {
        self.shared.lock().unwrap().state
    }

    fn set_state(&self, state: ClientState) {
        self.shared.lock().unwrap().state = state;
    }

    pub fn error(&self) -> Option<ClientError> {
        self.error
    }

    pub fn flow_id(&self) -> FlowId {
        self.route_current.flow_token.flow_id
    }

    pub fn public_key(&self) -> [u8; crypto::BOX_PUBLIC_KEY_SIZE] {
        self.public_key
    }

    pub fn set_mode(&mut self, mode: ClientMode) {
        self.mode = mode;
    }

    /// Pins the near relay query to an explicit location instead of the
    /// controller's geolocation of the client address.
    pub fn override_location(&mut self, latitude: f32, longitude: f32) {
        self.override_location = Some((latitude, longitude));
    }

    /// Marks the session as controller forced; direct fallback is then
    /// off the table.
    pub fn force_route_session(&mut self) {
        self.force_route = true;
        self.set_state(ClientState::Ready);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter as usize]
    }

    fn bump(&mut self, counter: Counter) {
        self.counters[counter as usize] += 1;
    }

    fn set_error(&mut self, error: ClientError) {
        self.error = Some(error);
    }

    // -------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------

    /// Opens a session from a route blob issued by the controller. A blob
    /// without a usable relay chain falls back to a direct session to the
    /// address named by the prefix.
    pub fn open_session(&mut self, route_data: &[u8]) -> Result<(), ClientError> {
        self.close_session();

        let mut cursor = route_data;

        let prefix = match RoutePrefix::read(&mut cursor) {
            Ok(prefix) => prefix,
            Err(_) => {
                logging::error!(self.log, "route data is invalid"; "reason" => "bad route prefix");
                return Err(ClientError::InvalidRoute);
            }
        };

        self.server_address = Address::None;
        match &prefix {
            RoutePrefix::ServerAddress(address) => {
                self.server_address = *address;
            }
            RoutePrefix::Direct(string) => {
                self.server_address = Address::from_str(string).unwrap_or(Address::None);
            }
            RoutePrefix::ForcedRoute => {
                self.force_route = true;
            }
            RoutePrefix::Null => {}
        }

        if let Some((route_state, flow_token, remaining)) = self.read_relay_route(cursor) {
            let time = self.clock.now();

            let flow_log =
                logging::flow(&self.log, flow_token.flow_id, flow_token.flow_version);
            logging::info!(flow_log, "client flow requested");

            self.route_state = route_state;

            let route = &mut self.route_current;
            route.time_last_packet_received = time;
            route.sequence = 1;
            route.replay_protection.reset();
            route.ping_history_server.reset();
            route.flow_token = flow_token;
            route.route_relay_count = (remaining.len() / SEALED_FLOW_TOKEN_BYTES) as u32 - 1;

            self.route_request = Vec::with_capacity(1 + remaining.len());
            self.route_request.push(PacketType::RouteRequest.into());
            self.route_request.extend_from_slice(remaining);

            self.set_state(ClientState::Requesting);

            self.route_request_sending = RouteRequestSending::Initial;
            self.route_changed_last = time;
            self.route_update_next = time + Self::BILLING_SLICE_SECS;

            self.route_previous = self.route_current.clone();

            self.bump(Counter::OpenSession);

            Ok(())
        } else {
            // No relay route in the blob; go direct off the prefix.

            if self.config.relay_only {
                logging::error!(self.log, "received direct route, but relay_only is set in config");
                return Err(ClientError::InvalidRoute);
            }

            match prefix {
                RoutePrefix::ServerAddress(address) => {
                    let string = address.to_string();
                    self.open_session_direct(&string)
                }
                RoutePrefix::Direct(string) => self.open_session_direct(&string),
                _ => {
                    logging::error!(self.log, "route data is invalid"; "reason" => "invalid route prefix");
                    Err(ClientError::BadServerAddress)
                }
            }
        }
    }

    /// Attempts to parse the relay route tail of a route blob: route
    /// state, the client's own flow token and the remaining token chain.
    fn read_relay_route<'a>(&self, data: &'a [u8]) -> Option<(Vec<u8>, FlowToken, &'a [u8])> {
        if data.len() < 4 {
            return None;
        }

        let route_state_bytes = LittleEndian::read_u32(&data[..4]) as usize;
        let mut stream = &data[4..];

        if route_state_bytes > controller::ROUTE_STATE_MAX_BYTES {
            logging::error!(self.log, "route data is invalid"; "reason" => "route state too large",
                            "bytes" => route_state_bytes);
            return None;
        }

        if stream.len() < route_state_bytes + SEALED_FLOW_TOKEN_BYTES {
            return None;
        }

        let route_state = stream[..route_state_bytes].to_vec();
        stream = &stream[route_state_bytes..];

        if stream.len() > controller::MAX_FLOW_TOKENS * SEALED_FLOW_TOKEN_BYTES {
            logging::error!(self.log, "route data is invalid"; "reason" => "too many bytes");
            return None;
        }

        let mut cursor = stream;
        let flow_token =
            match FlowToken::read_sealed(&mut cursor, &self.master_public_key, &self.private_key) {
                Ok(token) => token,
                Err(_) => {
                    logging::error!(self.log, "route data is invalid"; "reason" => "failed to decrypt token");
                    return None;
                }
            };

        // The chain must still hold at least the server's token.
        if cursor.len() < SEALED_FLOW_TOKEN_BYTES {
            logging::error!(self.log, "route data is invalid"; "reason" => "missing server token");
            return None;
        }

        Some((route_state, flow_token, cursor))
    }

    /// Opens a session straight to the server address, bypassing the
    /// controller entirely.
    pub fn open_session_direct(&mut self, server_address: &str) -> Result<(), ClientError> {
        if self.config.relay_only {
            logging::error!(self.log, "can't open direct session. relay_only is set in config");
            return Err(ClientError::RelayOnly);
        }

        if self.mode == ClientMode::ForceRelay {
            logging::error!(self.log, "can't open direct session. client mode forces the relay path");
            return Err(ClientError::RelayOnly);
        }

        let address = match Address::from_str(server_address) {
            Ok(address) => address,
            Err(_) => {
                logging::error!(self.log, "bad server address"; "address" => server_address);
                return Err(ClientError::BadServerAddress);
            }
        };

        self.close_session();

        logging::info!(self.log, "opening direct session"; "server" => server_address);

        self.server_address = address;
        self.route_current.flow_token.next_address = address;
        self.route_current.time_last_packet_received = self.clock.now();
        self.set_state(ClientState::Direct);
        self.route_request_sending = RouteRequestSending::Inactive;

        self.bump(Counter::OpenSessionDirect);

        Ok(())
    }

    /// Opens a session by asking the controller for an initial route
    /// directly, signed with the customer key. Development only.
    pub fn open_session_insecure(&mut self, data: &InsecureSessionData) -> Result<(), ClientError> {
        logging::debug!(self.log, "opening insecure session. don't ship with this!");

        self.close_session();

        let server_address = match Address::from_str(&data.server_address) {
            Ok(address) => address,
            Err(_) => {
                logging::error!(self.log, "bad server address"; "address" => data.server_address.as_str());
                return Err(ClientError::BadServerAddress);
            }
        };
        self.server_address = server_address;

        let info = self.build_client_info(true, self.clock.now());

        let request = InitialRouteRequest {
            kbps_up: data.kbps_up,
            kbps_down: data.kbps_down,
            user_id: data.user_id,
            platform_id: u32::from(data.platform_id),
            acceptable_latency: data.acceptable_latency,
            acceptable_jitter: data.acceptable_jitter,
            acceptable_packet_loss: data.acceptable_packet_loss,
            dest_relay: data.dest_relay,
            server_public_key: data.server_public_key_base64.clone(),
            max_price_per_gig: data.max_price_per_gig.clone(),
            direct_price_per_gig: data.direct_price_per_gig.clone(),
            mode: self.mode.value(),
            server_address: base64::encode(data.server_address.as_bytes()),
            client_info: base64::encode(&info.write()),
        };

        let request_json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(_) => return Err(ClientError::InsecureSessionFailed),
        };

        let signed =
            controller::sign_request(&request_json, data.customer_id, &data.customer_private_key);

        let body = match serde_json::to_string(&signed) {
            Ok(json) => json,
            Err(_) => return Err(ClientError::InsecureSessionFailed),
        };

        self.set_state(ClientState::InsecureRequesting);

        self.controller
            .post_initial_route(ROUTER_ROUTE_PATH, &body, HTTP_TIMEOUT_INITIAL_ROUTE_MS);

        Ok(())
    }

    /// Tears down the current session, notifying the relay chain when one
    /// is established, and returns the client to an idle state.
    pub fn close_session(&mut self) {
        if self.state() == ClientState::Established {
            self.bump(Counter::CloseSession);

            if self.migrate_packet_sending {
                for _ in 0..Self::MIGRATE_PACKET_SEND_COUNT {
                    let sequence = self.route_previous.sequence;
                    self.route_previous.sequence += 1;
                    send_migrate_packet(
                        &self.socket,
                        &self.log,
                        &self.route_previous.flow_token,
                        sequence,
                    );
                }
                self.migrate_packet_sending = false;
            }

            for _ in 0..Self::DESTROY_PACKET_SEND_COUNT {
                let sequence = self.route_current.sequence;
                self.route_current.sequence += 1;
                send_destroy_packet(
                    &self.socket,
                    &self.log,
                    &self.route_current.flow_token,
                    sequence,
                );
            }
        }

        self.error = None;

        let state = self.state();
        if state > ClientState::Ready {
            // The client was connected in some fashion; bring it back to
            // Ready or Locating.
            if self.backup_flow || state == ClientState::Direct {
                // A direct session has not been refreshing near relays.
                if self.config.direct_only {
                    self.set_state(ClientState::Ready);
                } else {
                    self.near_relays.clear();
                    self.set_state(ClientState::Locating);
                }
            } else {
                self.set_state(ClientState::Ready);
            }
        }

        self.route_update_last = 0.0;
        self.http_request_sending = HttpRequestSending::Inactive;
        self.route_request_sending = RouteRequestSending::Inactive;
        self.route_current.reset();
        self.route_previous.reset();
        self.server_address = Address::None;
        self.route_request.clear();
        self.route_state.clear();
        self.server_token = [0u8; SEALED_SERVER_TOKEN_BYTES];
        self.direct_ping_history.reset();
        self.stats_history.reset();
        self.last_server_ping = 0.0;
        self.last_stats_sample = 0.0;
        self.backup_flow = false;
        self.force_route = false;
        self.relay_rtt_worse_than_direct_count = 0;
        self.locating_retries = 0;

        self.controller.cancel_all();

        self.shared.lock().unwrap().queues.clear();
    }

    // -------------------------------------------------------------
    // Send path
    // -------------------------------------------------------------

    /// Sends game payload to the server along whichever path the session
    /// currently uses. Payloads above the MTU are rejected.
    pub fn send_packet(&mut self, payload: &[u8]) {
        if payload.len() > MTU {
            logging::warn!(self.log, "send packet dropped packet larger than MTU";
                           "bytes" => payload.len());
            return;
        }

        let state = self.state();

        if state == ClientState::Direct {
            let mut packet = Vec::with_capacity(1 + payload.len());
            packet.push(PacketType::Direct.into());
            packet.extend_from_slice(payload);

            send_raw(&self.socket, &self.route_current.flow_token.next_address, &packet);
        } else if self.backup_flow {
            self.route_current.sequence += 1;

            let mut packet = Vec::with_capacity(BACKUP_BYTES + payload.len());
            packet.push(PacketType::Backup.into());

            let mut flow_bytes = [0u8; 8];
            LittleEndian::write_u64(&mut flow_bytes, self.route_current.flow_token.flow_id);
            packet.extend_from_slice(&flow_bytes);
            packet.extend_from_slice(payload);

            send_raw(&self.socket, &self.server_address, &packet);
        } else if state == ClientState::Requesting || state == ClientState::Established {
            let route = send_route(
                self.route_request_sending,
                &mut self.route_current,
                &mut self.route_previous,
            );

            let mut packet = vec![0u8; HEADER_BYTES + payload.len()];

            let head = Header {
                packet_type: PacketType::ClientToServer,
                sequence: route.sequence,
                flow_id: route.flow_token.flow_id,
                flow_version: route.flow_token.flow_version,
                flow_flags: route.flow_token.flow_flags,
            };

            if header::write_header(&head, &route.flow_token.private_key, &mut packet).is_err() {
                logging::error!(self.log, "client failed to send packet to server";
                                "reason" => "failed to write header");
                return;
            }

            route.sequence += 1;

            packet[HEADER_BYTES..].copy_from_slice(payload);

            let to = route.flow_token.next_address;
            send_raw(&self.socket, &to, &packet);
        }
    }

    // -------------------------------------------------------------
    // Update pump
    // -------------------------------------------------------------

    /// The per frame pump, called from the game thread: drains captured
    /// packets, advances every timer and polls the controller.
    pub fn update(&mut self) {
        let time = self.clock.now();

        self.update_timeouts(time);
        self.update_location(time);
        self.update_session(time);
        self.ping_near_relays(time);
        self.update_packet_queue();
        self.update_stats(time);
        self.update_counters(time);
        self.poll_controller(time);
    }

    fn update_timeouts(&mut self, time: f64) {
        // Flow id 0 in these records just means no session yet; logging
        // it is harmless.
        let flow_id = self.route_current.flow_token.flow_id;
        let flow_version = self.route_current.flow_token.flow_version;

        let state = self.state();

        if (state == ClientState::Established || state == ClientState::Requesting)
            && !self.backup_flow
            && self.route_update_next + Self::ROUTE_UPDATE_GRACE_SECS < time
        {
            if !self.backup_flow_if_possible() {
                logging::error!(logging::flow(&self.log, flow_id, flow_version),
                                "route update timed out");
                self.set_error(ClientError::RouteTimedOut);
                self.set_state(ClientState::Ready);
                self.bump(Counter::RouteUpdateTimeout);
                return;
            }
        }

        let connected = state == ClientState::Established
            || state == ClientState::Requesting
            || state == ClientState::Direct
            || self.backup_flow;

        if connected
            && self.route_current.time_last_packet_received + self.config.session_timeout_secs
                <= time
        {
            logging::error!(logging::flow(&self.log, flow_id, flow_version), "client timed out");
            self.set_error(ClientError::TimedOut);
            self.set_state(ClientState::Ready);
            self.bump(Counter::ServerToClientTimeout);
        }
    }

    fn backup_flow_if_possible(&mut self) -> bool {
        if !self.config.relay_only
            && self.mode != ClientMode::ForceRelay
            && !self.force_route
            && !self.server_address.is_none()
        {
            if !self.backup_flow {
                logging::warn!(logging::flow(&self.log,
                                             self.route_current.flow_token.flow_id,
                                             self.route_current.flow_token.flow_version),
                               "fallback to direct");
                self.bump(Counter::FallbackToDirect);
                self.backup_flow = true;
            }
            return true;
        }

        false
    }

    fn update_location(&mut self, time: f64) {
        if self.backup_flow || self.config.direct_only || self.force_route {
            return;
        }

        match self.state() {
            ClientState::Locating => {
                if self.near_relays.is_empty() {
                    // Still fetching near relays.
                    if self.http_request_sending == HttpRequestSending::Inactive
                        && time - self.near_update_last > Self::LOCATING_RETRY_SECS
                    {
                        if self.locating_retries < Self::LOCATING_MAX_RETRIES {
                            self.near_update_last = time;
                            self.locating_retries += 1;
                            self.get_near_relays();
                        } else {
                            self.done_locating();
                        }
                    }
                } else if time - self.near_update_last > Self::LOCATING_SETTLE_SECS {
                    // Relays are known and have had a couple of seconds of
                    // pings; sessions may open now.
                    self.set_state(ClientState::Ready);
                }
            }
            ClientState::Ready => {
                // Waiting to connect; keep the near relay set fresh. The
                // established state refreshes through route updates instead.
                if time - self.near_update_last > Self::NEAR_REFRESH_SECS {
                    self.near_update_last = time;
                    self.get_near_relays();
                }
            }
            _ => {}
        }
    }

    fn get_near_relays(&mut self) {
        self.http_request_sending = HttpRequestSending::Near;

        logging::info!(self.log, "requesting near relays");

        let path = controller::near_relays_path(self.override_location);
        self.controller
            .get_near_relays(&path, HTTP_TIMEOUT_NEAR_RELAYS_MS);
    }

    fn done_locating(&mut self) {
        if self.near_relays.is_empty() {
            self.bump(Counter::NoNearRelays);

            if self.config.relay_only {
                logging::error!(self.log, "no near relays");
                self.set_error(ClientError::FailedToLocate);
            } else {
                logging::warn!(self.log, "no near relays, falling back to direct");
                if self.state() > ClientState::Stopped {
                    self.set_state(ClientState::Ready);
                }
            }
        }
    }

    fn update_session(&mut self, time: f64) {
        if self.backup_flow || self.config.direct_only {
            return;
        }

        let state = self.state();

        if state == ClientState::Direct || state < ClientState::Locating {
            return;
        }

        if time >= self.route_update_next
            && time > self.route_update_last + Self::ROUTE_UPDATE_MIN_SPACING
            && self.http_request_sending == HttpRequestSending::Inactive
        {
            self.route_update_last = time;

            if state != ClientState::Established {
                logging::debug!(self.log, "want to request route update, but client is not established";
                                "state" => ?state);
            } else {
                self.request_route_update(time);
            }
        }

        // Keep telling the old relay chain about the migration until it
        // acknowledges.
        if self.migrate_packet_sending && time - self.migrate_packet_last >= Self::RESEND_INTERVAL {
            self.migrate_packet_last = time;

            let sequence = self.route_previous.sequence;
            self.route_previous.sequence += 1;
            send_migrate_packet(&self.socket, &self.log, &self.route_previous.flow_token, sequence);
        }

        // Retransmit the pending route or continue request until its
        // response arrives.
        if self.route_request_sending != RouteRequestSending::Inactive
            && !self.route_request.is_empty()
            && time - self.route_request_last >= Self::RESEND_INTERVAL
        {
            self.route_request_last = time;

            let to = self.route_current.flow_token.next_address;
            send_raw(&self.socket, &to, &self.route_request);

            logging::debug!(logging::flow(&self.log,
                                          self.route_current.flow_token.flow_id,
                                          self.route_current.flow_token.flow_version),
                            "sent route request"; "to" => to.to_string());
        }
    }

    fn request_route_update(&mut self, time: f64) {
        if self.route_request_sending != RouteRequestSending::Inactive {
            logging::warn!(logging::flow(&self.log,
                                         self.route_current.flow_token.flow_id,
                                         self.route_current.flow_token.flow_version),
                           "performing a route update, but a route request is still in flight";
                           "sending" => ?self.route_request_sending);
        }

        let info = self.build_client_info(false, time);

        let request = RouteUpdateRequest {
            route_state: base64::encode(&self.route_state),
            server_token: base64::encode(&self.server_token[..]),
            client_info: base64::encode(&info.write()),
            mode: self.mode.value(),
        };

        let body = match serde_json::to_string(&request) {
            Ok(body) => body,
            Err(_) => {
                logging::error!(self.log, "failed to build route update request");
                return;
            }
        };

        self.http_request_sending = HttpRequestSending::RouteUpdate;

        logging::info!(logging::flow(&self.log,
                                     self.route_current.flow_token.flow_id,
                                     self.route_current.flow_token.flow_version),
                       "requesting route update");

        self.controller
            .post_route_update(ROUTER_UPDATE_PATH, &body, HTTP_TIMEOUT_ROUTE_UPDATE_MS);
    }

    fn ping_near_relays(&mut self, time: f64) {
        if self.backup_flow || self.config.direct_only {
            return;
        }

        let state = self.state();
        if state == ClientState::Direct || state < ClientState::Locating {
            return;
        }

        if time - self.ping_relays_last < Self::PING_RELAYS_INTERVAL {
            return;
        }

        self.ping_relays_last = time;

        let flow_id = self.route_current.flow_token.flow_id;

        for relay in &self.near_relays {
            if !self.relay_ping_history.contains_key(&relay.id)
                && self.relay_ping_history.len() >= Self::MAX_RELAY_HISTORIES
            {
                // Make room; relays that fell out of the near set lose
                // their history first.
                let near_relays = &self.near_relays;
                let victim = self
                    .relay_ping_history
                    .keys()
                    .find(|id| !near_relays.iter().any(|near| near.id == **id))
                    .or_else(|| self.relay_ping_history.keys().next())
                    .copied();

                if let Some(victim) = victim {
                    self.relay_ping_history.remove(&victim);
                }
            }

            let entry = self
                .relay_ping_history
                .entry(relay.id)
                .or_insert_with(|| RelayPingHistory {
                    address: relay.address,
                    history: PingHistory::new(),
                });

            entry.address = relay.address;

            let sequence = entry.history.insert(time);

            let packet = header::write_ping(PacketType::ClientRelayPing, flow_id, sequence);
            send_raw(&self.socket, &relay.address, &packet);
        }
    }

    fn update_packet_queue(&mut self) {
        // Take the scratch queue out of self so the drained batch can be
        // walked while the handlers borrow the client.
        let mut batch = mem::replace(&mut self.scratch, PacketQueue::new(0));

        {
            let mut shared = self.shared.lock().unwrap();
            shared.queues.flip(&mut batch);
        }

        for packet in batch.iter() {
            self.process_incoming_packet(packet);
        }

        batch.clear();
        self.scratch = batch;
    }

    fn update_stats(&mut self, time: f64) {
        if time - self.last_server_ping >= Self::PING_SERVER_INTERVAL {
            self.last_server_ping = time;

            // Ping the server directly.
            if !self.server_address.is_none() {
                let sequence = self.direct_ping_history.insert(time);
                let packet = header::write_ping(
                    PacketType::DirectServerPing,
                    self.route_current.flow_token.flow_id,
                    sequence,
                );
                send_raw(&self.socket, &self.server_address, &packet);
            }

            // Ping the server along the relay path.
            let state = self.state();
            if state == ClientState::Established && !self.backup_flow {
                let route = send_route(
                    self.route_request_sending,
                    &mut self.route_current,
                    &mut self.route_previous,
                );

                let head = Header {
                    packet_type: PacketType::RelayServerPing,
                    sequence: route.sequence,
                    flow_id: route.flow_token.flow_id,
                    flow_version: route.flow_token.flow_version,
                    flow_flags: route.flow_token.flow_flags,
                };

                let mut packet = [0u8; HEADER_BYTES + PING_PONG_BYTES];

                if header::write_header(&head, &route.flow_token.private_key, &mut packet).is_ok() {
                    route.sequence += 1;

                    let ping_sequence = route.ping_history_server.insert(time);

                    if header::write_ping_body(
                        route.flow_token.flow_id,
                        ping_sequence,
                        &mut packet[HEADER_BYTES..],
                    )
                    .is_ok()
                    {
                        let to = route.flow_token.next_address;
                        send_raw(&self.socket, &to, &packet);
                    }
                } else {
                    logging::error!(self.log, "failed to write relay server ping header");
                }
            }
        }

        if time - self.last_stats_sample >= Self::SAMPLE_STATS_INTERVAL {
            self.last_stats_sample = time;

            let direct = self.stats_direct(time);
            let relay = self.stats_relay(time);

            self.stats_history.insert(StatsSample {
                time,
                relay_rtt: relay.rtt,
                relay_jitter: relay.jitter,
                relay_packet_loss: relay.packet_loss,
                direct_rtt: direct.rtt,
                direct_jitter: direct.jitter,
                direct_packet_loss: direct.packet_loss,
            });

            self.relay_rtt_worse_than_direct_count = if direct.has_data()
                && relay.has_data()
                && direct.rtt - Self::LATENCY_THRESHOLD <= relay.rtt
                && !self.backup_flow
            {
                self.relay_rtt_worse_than_direct_count + 1
            } else {
                0
            };
        }

        if !self.config.relay_only
            && !self.config.disable_cant_beat_direct
            && self.relay_rtt_worse_than_direct_count >= Self::MAX_LATENCY_FAILURES
            && !self.backup_flow
            && !self.force_route
            && self.state() == ClientState::Established
            && !self.server_address.is_none()
            && self.mode != ClientMode::ForceRelay
        {
            logging::info!(logging::flow(&self.log,
                                         self.route_current.flow_token.flow_id,
                                         self.route_current.flow_token.flow_version),
                           "can't beat direct");
            self.bump(Counter::CantBeatDirect);
            self.backup_flow = true;
        }
    }

    fn update_counters(&mut self, time: f64) {
        if self.counter_check_last + Self::COUNTER_CHECK_SECS < time
            && self.counter_post_last + Self::COUNTER_POST_SECS < time
        {
            if self.counters.iter().any(|counter| *counter != 0) {
                self.upload_counters(time);
            }
            self.counter_check_last = time;
        }
    }

    fn upload_counters(&mut self, time: f64) {
        logging::debug!(self.log, "uploading client counters");

        let upload = CounterUpload {
            counters: self.counters.to_vec(),
        };

        if let Ok(body) = serde_json::to_string(&upload) {
            self.controller
                .post_counters(STATS_COUNTERS_PATH, &body, HTTP_TIMEOUT_COUNTERS_MS);
        }

        self.counters = [0u64; COUNTER_COUNT];
        self.counter_post_last = time;
    }

    fn poll_controller(&mut self, time: f64) {
        let events = self.controller.poll();

        for event in events {
            match event {
                ControllerEvent::NearRelays { status, body } => {
                    self.on_near_relays_response(status, &body)
                }
                ControllerEvent::InitialRoute { status, body } => {
                    self.on_initial_route_response(status, &body)
                }
                ControllerEvent::RouteUpdate { status, body } => {
                    self.on_route_update_response(status, &body, time)
                }
            }
        }
    }

    // -------------------------------------------------------------
    // Controller responses
    // -------------------------------------------------------------

    fn on_near_relays_response(&mut self, status: u16, body: &str) {
        self.http_request_sending = HttpRequestSending::Inactive;

        if status != 200 {
            logging::warn!(self.log, "failed to get near relays"; "status" => status);
            return;
        }

        let (relays, public_ip) = match controller::parse_near_relays(body) {
            Ok(parsed) => parsed,
            Err(_) => {
                logging::warn!(self.log, "failed to parse near relays response");
                return;
            }
        };

        logging::info!(self.log, "received near relays"; "count" => relays.len());

        self.near_relays = relays;
        if !public_ip.is_none() {
            self.public_ip = public_ip;
        }

        if self.state() == ClientState::Locating {
            self.done_locating();
        }
    }

    fn on_initial_route_response(&mut self, status: u16, body: &str) {
        let mut success = false;

        if status == 200 {
            if let Ok(response) = serde_json::from_str::<RouteUpdateResponse>(body) {
                if let Some(route_relays) = &response.route_relays {
                    logging::info!(self.log, "insecure session: initial route"; "relays" => route_relays.as_str());
                }
                if let Some(route_data) = &response.route_data {
                    if let Ok(raw) = base64::decode(route_data) {
                        success = self.open_session(&raw).is_ok();
                    }
                }
            }
        } else if status == 404 && !self.config.relay_only {
            // No routes found; go direct instead.
            logging::info!(self.log, "insecure session: no routes found, going direct");
            let server_address = self.server_address.to_string();
            success = self.open_session_direct(&server_address).is_ok();
        } else {
            logging::error!(self.log, "insecure session: initial route request error";
                            "status" => status);
        }

        if !success {
            logging::error!(self.log, "client insecure session failed");
            self.set_error(ClientError::InsecureSessionFailed);
            self.set_state(ClientState::Ready);
        }
    }

    fn on_route_update_response(&mut self, status: u16, body: &str, time: f64) {
        self.http_request_sending = HttpRequestSending::Inactive;

        if status != 200 {
            logging::warn!(logging::flow(&self.log,
                                         self.route_current.flow_token.flow_id,
                                         self.route_current.flow_token.flow_version),
                           "route update failed"; "status" => status);
            return;
        }

        self.handle_route_update(body, time);
    }

    fn handle_route_update(&mut self, body: &str, time: f64) {
        let flow_id = self.route_current.flow_token.flow_id;
        let flow_version = self.route_current.flow_token.flow_version;
        let flow_log = logging::flow(&self.log, flow_id, flow_version);

        let response: RouteUpdateResponse = match serde_json::from_str(body) {
            Ok(response) => response,
            Err(_) => {
                logging::error!(flow_log, "failed to parse route update response");
                return;
            }
        };

        if !self.force_route {
            match &response.relays {
                Some(relays) => {
                    self.near_relays = controller::convert_relays(relays);
                    logging::info!(flow_log, "received near relays"; "count" => self.near_relays.len());
                }
                None => {
                    logging::debug!(flow_log, "route update carried no near relays");
                }
            }
        }

        let has_continue = response
            .continue_data
            .as_ref()
            .map(|data| !data.is_empty())
            .unwrap_or(false);

        if has_continue {
            let raw = match base64::decode(response.continue_data.as_ref().unwrap()) {
                Ok(raw) => raw,
                Err(_) => {
                    logging::error!(flow_log, "failed to base64 decode continue data");
                    return;
                }
            };

            self.handle_continue_update(&raw, &response, &flow_log);
        } else if let Some(route_data) = &response.route_data {
            let raw = match base64::decode(route_data) {
                Ok(raw) => raw,
                Err(_) => {
                    logging::error!(flow_log, "failed to base64 decode route data");
                    return;
                }
            };

            self.handle_new_route(&raw, &response, time, &flow_log);
        }
    }

    /// A continue update extends the current route for another billing
    /// slice without rotating keys; only the route state and the request
    /// token chain advance.
    fn handle_continue_update(&mut self, raw: &[u8], response: &RouteUpdateResponse, flow_log: &Logger) {
        let data = match controller::read_route_data(raw) {
            Ok(data) => data,
            Err(_) => {
                logging::error!(flow_log, "could not read continue data");
                return;
            }
        };

        if data.tokens.len() < SEALED_CONTINUE_TOKEN_BYTES {
            logging::error!(flow_log, "not enough bytes to read encrypted continue token");
            return;
        }

        let mut cursor = &data.tokens[..];
        let token = match ContinueToken::read_sealed(
            &mut cursor,
            &self.master_public_key,
            &self.private_key,
        ) {
            Ok(token) => token,
            Err(_) => {
                logging::error!(flow_log, "failed to decrypt continue token");
                return;
            }
        };

        if self.state() != ClientState::Established {
            return;
        }

        if token.flow_id != self.route_current.flow_token.flow_id
            || token.flow_version != self.route_current.flow_token.flow_version
        {
            logging::error!(flow_log, "received invalid continue token");
            return;
        }

        match &response.route_relays {
            Some(relays) => logging::info!(flow_log, "holding route"; "relays" => relays.as_str()),
            None => logging::info!(flow_log, "holding route"),
        }

        if self.route_request_sending == RouteRequestSending::Update {
            // Last response wins, but losing in-flight route update state
            // is worth a warning.
            logging::warn!(flow_log, "continue data overwrote pending route update state");
        }

        self.route_state = data.route_state.clone();

        self.route_request_sending = RouteRequestSending::Continue;

        self.route_request = Vec::with_capacity(1 + cursor.len());
        self.route_request.push(PacketType::ContinueRequest.into());
        self.route_request.extend_from_slice(cursor);

        self.route_update_next += Self::BILLING_SLICE_SECS;
    }

    /// A route update rotates the flow onto a fresh relay chain: the
    /// current route moves to the previous slot and keeps carrying
    /// traffic until the new chain acknowledges.
    fn handle_new_route(
        &mut self,
        raw: &[u8],
        response: &RouteUpdateResponse,
        time: f64,
        flow_log: &Logger,
    ) {
        let data = match controller::read_route_data(raw) {
            Ok(data) => data,
            Err(_) => {
                logging::error!(flow_log, "could not read route data");
                return;
            }
        };

        if data.tokens.len() < 2 * SEALED_FLOW_TOKEN_BYTES {
            logging::error!(flow_log, "not enough bytes to read encrypted flow token chain");
            return;
        }

        let mut cursor = &data.tokens[..];
        let token = match FlowToken::read_sealed(
            &mut cursor,
            &self.master_public_key,
            &self.private_key,
        ) {
            Ok(token) => token,
            Err(_) => {
                logging::error!(flow_log, "failed to decrypt flow token from route data");
                return;
            }
        };

        if self.state() < ClientState::Requesting {
            return;
        }

        let new_flow_log = logging::flow(&self.log, token.flow_id, token.flow_version);
        match &response.route_relays {
            Some(relays) => logging::info!(new_flow_log, "new route"; "relays" => relays.as_str()),
            None => logging::info!(new_flow_log, "new route"),
        }

        self.route_state = data.route_state.clone();

        self.route_request_sending = RouteRequestSending::Update;

        self.migrate_packet_sending = true;

        self.route_previous = self.route_current.clone();
        self.route_current.replay_protection.reset();
        self.route_current.sequence = 1;
        self.route_current.flow_token = token;
        self.route_current.ping_history_server.reset();
        self.route_current.route_relay_count =
            (data.tokens.len() / SEALED_FLOW_TOKEN_BYTES) as u32 - 2;

        self.route_request = Vec::with_capacity(1 + cursor.len());
        self.route_request.push(PacketType::RouteRequest.into());
        self.route_request.extend_from_slice(cursor);

        self.route_changed_last = time;
        self.route_update_next += Self::BILLING_SLICE_SECS;
    }

    // -------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------

    fn stats_direct(&self, time: f64) -> RouteStats {
        self.direct_ping_history.stats(time - Self::STATS_WINDOW, time)
    }

    fn route_over_relay_path(&self, route: &ClientRoute, state: ClientState) -> bool {
        !(state == ClientState::Direct || route.route_relay_count == 0 || self.backup_flow)
    }

    /// Relay path statistics. A route that changed moments ago has no
    /// useful ping history yet, so the previous route answers while it is
    /// still valid.
    fn stats_relay(&self, time: f64) -> RouteStats {
        let state = self.state();

        if self.route_over_relay_path(&self.route_current, state) {
            if time - self.route_changed_last > Self::ROUTE_STATS_SETTLE_SECS {
                return self
                    .route_current
                    .ping_history_server
                    .stats(time - Self::STATS_WINDOW, time);
            }

            if self.route_over_relay_path(&self.route_previous, state) {
                return self
                    .route_previous
                    .ping_history_server
                    .stats(time - Self::STATS_WINDOW, time);
            }
        }

        RouteStats::no_data()
    }

    pub fn stats(&self) -> ClientStats {
        let time = self.clock.now();

        ClientStats {
            relay: self.stats_relay(time),
            direct: self.stats_direct(time),
            samples: self.stats_history.snapshot(),
        }
    }

    /// Current RTT per near relay, for the game UI.
    pub fn near_relay_stats(&self) -> Vec<NearRelayStat> {
        let time = self.clock.now();

        self.near_relays
            .iter()
            .filter_map(|relay| {
                self.relay_ping_history.get(&relay.id).and_then(|entry| {
                    let stats = entry.history.stats(0.0, time);
                    if stats.rtt > 0.0 {
                        Some(NearRelayStat {
                            id: relay.id,
                            rtt: stats.rtt,
                        })
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    fn build_client_info(&self, include_key: bool, time: f64) -> ClientInfo {
        let mut relay_stats = Vec::new();

        for relay in &self.near_relays {
            if let Some(entry) = self.relay_ping_history.get(&relay.id) {
                let stats = entry.history.stats(0.0, time);
                if stats.rtt > 0.0 {
                    relay_stats.push(RelayStat {
                        id: relay.id,
                        rtt: stats.rtt,
                        jitter: stats.jitter,
                        packet_loss: stats.packet_loss,
                    });
                }
            }
        }

        ClientInfo {
            time,
            relay: self.stats_relay(time),
            direct: self.stats_direct(time),
            relay_stats,
            public_ip: self.public_ip,
            public_key: if include_key { Some(self.public_key) } else { None },
        }
    }

    // -------------------------------------------------------------
    // Incoming packets
    // -------------------------------------------------------------

    fn process_incoming_packet(&mut self, packet: &IncomingPacket) {
        if packet.length < 1 {
            return;
        }

        match PacketType::from_u8(packet.data[0]) {
            Some(PacketType::Direct) => self.process_direct_packet(packet),
            Some(PacketType::Backup) => self.process_backup_packet(packet),
            Some(PacketType::DirectServerPong) => self.process_direct_server_pong(packet),
            Some(PacketType::ClientRelayPong) => self.process_client_relay_pong(packet),
            Some(PacketType::RelayServerPong) => self.process_relay_server_pong(packet),
            Some(PacketType::MigrateResponse) => self.process_migrate_response(packet),
            Some(PacketType::RouteResponse) => self.process_route_response(packet),
            Some(PacketType::ContinueResponse) => self.process_continue_response(packet),
            Some(PacketType::ServerToClient) => self.process_server_to_client(packet),
            _ => {}
        }
    }

    /// Validates a routed packet against one held route: session still
    /// alive, tag verifies under the route key, flow matches, sequence not
    /// replayed.
    fn read_packet_header(&mut self, timestamp: f64, packet: &[u8]) -> Option<WhichRoute> {
        let timeout = self.config.session_timeout_secs;

        if route_read_packet_header(timeout, &self.log, &mut self.route_current, timestamp, packet)
        {
            return Some(WhichRoute::Current);
        }

        if route_read_packet_header(timeout, &self.log, &mut self.route_previous, timestamp, packet)
        {
            return Some(WhichRoute::Previous);
        }

        None
    }

    fn from_next_hop(&self, from: &Address) -> bool {
        *from == self.route_current.flow_token.next_address
            || *from == self.route_previous.flow_token.next_address
    }

    fn process_direct_packet(&mut self, packet: &IncomingPacket) {
        if packet.from != self.server_address {
            logging::debug!(self.log, "ignored direct packet"; "reason" => "not from server address");
            return;
        }

        self.route_current.time_last_packet_received = packet.timestamp;

        (self.on_packet)(&packet.data[1..packet.length]);
    }

    fn process_backup_packet(&mut self, packet: &IncomingPacket) {
        if packet.from != self.server_address {
            logging::debug!(self.log, "ignored backup packet"; "reason" => "not from server address");
            return;
        }

        if packet.length <= BACKUP_BYTES {
            logging::debug!(self.log, "ignored backup packet"; "reason" => "not enough bytes");
            return;
        }

        if self.route_current.time_last_packet_received + self.config.session_timeout_secs
            < packet.timestamp
        {
            logging::debug!(self.log, "ignored backup packet"; "reason" => "session timed out");
            return;
        }

        let flow_id = LittleEndian::read_u64(&packet.data[1..9]);
        if flow_id != self.route_current.flow_token.flow_id {
            logging::debug!(self.log, "ignored backup packet"; "reason" => "wrong flow id",
                            "flow_id" => format!("{:016x}", flow_id));
            return;
        }

        self.route_current.time_last_packet_received = packet.timestamp;

        (self.on_packet)(&packet.data[BACKUP_BYTES..packet.length]);
    }

    fn process_direct_server_pong(&mut self, packet: &IncomingPacket) {
        if packet.from != self.server_address {
            logging::debug!(self.log, "ignored direct server pong"; "reason" => "not from server address");
            return;
        }

        if packet.length != PING_PONG_BYTES {
            logging::debug!(self.log, "ignored direct server pong"; "reason" => "bad packet length");
            return;
        }

        let (flow_id, sequence) = match header::read_ping(packet.payload()) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        if flow_id != self.route_current.flow_token.flow_id {
            logging::debug!(self.log, "ignored direct server pong"; "reason" => "flow id mismatch");
            return;
        }

        self.direct_ping_history.pong_received(sequence, packet.timestamp);

        self.route_current.time_last_packet_received = packet.timestamp;
    }

    fn process_client_relay_pong(&mut self, packet: &IncomingPacket) {
        if packet.length != PING_PONG_BYTES {
            logging::debug!(self.log, "ignored client relay pong"; "reason" => "bad packet length");
            return;
        }

        let (flow_id, sequence) = match header::read_ping(packet.payload()) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        if flow_id != self.route_current.flow_token.flow_id {
            logging::debug!(self.log, "ignored client relay pong"; "reason" => "flow id mismatch");
            return;
        }

        let entry = self
            .relay_ping_history
            .values_mut()
            .find(|entry| entry.address == packet.from);

        match entry {
            Some(entry) => entry.history.pong_received(sequence, packet.timestamp),
            None => {
                logging::debug!(self.log, "ignored client relay pong";
                                "reason" => "could not find ping history");
            }
        }
    }

    fn process_relay_server_pong(&mut self, packet: &IncomingPacket) {
        if !self.from_next_hop(&packet.from) {
            logging::debug!(self.log, "ignored relay server pong"; "reason" => "not from next hop");
            return;
        }

        if packet.length != HEADER_BYTES + PING_PONG_BYTES {
            logging::debug!(self.log, "ignored relay server pong"; "reason" => "bad packet length");
            return;
        }

        let which = match self.read_packet_header(packet.timestamp, packet.payload()) {
            Some(which) => which,
            None => {
                logging::debug!(self.log, "ignored relay server pong"; "reason" => "could not read header");
                return;
            }
        };

        let route = match which {
            WhichRoute::Current => &mut self.route_current,
            WhichRoute::Previous => &mut self.route_previous,
        };

        let (flow_id, sequence) =
            match header::read_ping_body(&packet.data[HEADER_BYTES..packet.length]) {
                Ok(parsed) => parsed,
                Err(_) => return,
            };

        if flow_id != route.flow_token.flow_id {
            logging::debug!(self.log, "ignored relay server pong"; "reason" => "flow id mismatch");
            return;
        }

        route.ping_history_server.pong_received(sequence, packet.timestamp);
        route.time_last_packet_received = packet.timestamp;
    }

    fn process_migrate_response(&mut self, packet: &IncomingPacket) {
        if !self.from_next_hop(&packet.from) {
            logging::warn!(self.log, "ignored migrate response"; "reason" => "not from next hop");
            return;
        }

        if !route_read_packet_header(
            self.config.session_timeout_secs,
            &self.log,
            &mut self.route_previous,
            packet.timestamp,
            packet.payload(),
        ) {
            logging::warn!(self.log, "ignored migrate response"; "reason" => "could not read header");
            return;
        }

        logging::debug!(logging::flow(&self.log,
                                      self.route_previous.flow_token.flow_id,
                                      self.route_previous.flow_token.flow_version),
                        "received migrate response");

        self.migrate_packet_sending = false;
    }

    fn process_route_response(&mut self, packet: &IncomingPacket) {
        if packet.from != self.route_current.flow_token.next_address {
            logging::warn!(self.log, "ignored route response"; "reason" => "not from next hop");
            return;
        }

        if packet.length != HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES {
            logging::warn!(self.log, "ignored route response"; "reason" => "bad packet length",
                           "expected" => HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES,
                           "got" => packet.length);
            return;
        }

        if !route_read_packet_header(
            self.config.session_timeout_secs,
            &self.log,
            &mut self.route_current,
            packet.timestamp,
            packet.payload(),
        ) {
            logging::warn!(self.log, "ignored route response"; "reason" => "could not read header");
            return;
        }

        let flow_log = logging::flow(&self.log,
                                     self.route_current.flow_token.flow_id,
                                     self.route_current.flow_token.flow_version);

        let state = self.state();

        if state == ClientState::Requesting {
            logging::info!(flow_log, "client flow established");
            self.set_state(ClientState::Established);
            self.server_token
                .copy_from_slice(&packet.data[HEADER_BYTES..HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES]);
            self.route_request_sending = RouteRequestSending::Inactive;
        } else if state == ClientState::Established
            && self.route_request_sending == RouteRequestSending::Update
        {
            logging::info!(flow_log, "received route update response");
            self.server_token
                .copy_from_slice(&packet.data[HEADER_BYTES..HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES]);
            self.route_request_sending = RouteRequestSending::Inactive;
        } else {
            logging::debug!(flow_log, "ignored route response"; "reason" => "not sending route request");
        }
    }

    fn process_continue_response(&mut self, packet: &IncomingPacket) {
        if packet.from != self.route_current.flow_token.next_address {
            logging::warn!(self.log, "ignored continue response"; "reason" => "not from next hop");
            return;
        }

        if packet.length != HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES {
            logging::warn!(self.log, "ignored continue response"; "reason" => "bad packet length",
                           "expected" => HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES,
                           "got" => packet.length);
            return;
        }

        if !route_read_packet_header(
            self.config.session_timeout_secs,
            &self.log,
            &mut self.route_current,
            packet.timestamp,
            packet.payload(),
        ) {
            logging::warn!(self.log, "ignored continue response"; "reason" => "could not read header");
            return;
        }

        let flow_log = logging::flow(&self.log,
                                     self.route_current.flow_token.flow_id,
                                     self.route_current.flow_token.flow_version);

        if self.route_request_sending != RouteRequestSending::Continue
            || self.state() != ClientState::Established
        {
            logging::debug!(flow_log, "ignored continue response"; "reason" => "not sending continue");
            return;
        }

        logging::info!(flow_log, "received continue response");
        self.server_token
            .copy_from_slice(&packet.data[HEADER_BYTES..HEADER_BYTES + SEALED_SERVER_TOKEN_BYTES]);
        self.route_request_sending = RouteRequestSending::Inactive;
    }

    fn process_server_to_client(&mut self, packet: &IncomingPacket) {
        if !self.from_next_hop(&packet.from) {
            logging::debug!(self.log, "ignored server to client packet"; "reason" => "not from next hop");
            return;
        }

        if packet.length <= HEADER_BYTES {
            logging::debug!(self.log, "ignored server to client packet"; "reason" => "not enough bytes");
            return;
        }

        if packet.length > HEADER_BYTES + MTU {
            logging::debug!(self.log, "ignored server to client packet"; "reason" => "too many bytes");
            return;
        }

        let which = match self.read_packet_header(packet.timestamp, packet.payload()) {
            Some(which) => which,
            None => {
                logging::debug!(self.log, "ignored server to client packet";
                                "reason" => "could not read header");
                return;
            }
        };

        let route = match which {
            WhichRoute::Current => &mut self.route_current,
            WhichRoute::Previous => &mut self.route_previous,
        };

        route.time_last_packet_received = packet.timestamp;

        (self.on_packet)(&packet.data[HEADER_BYTES..packet.length]);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_session();

        if self.counters.iter().any(|counter| *counter != 0) {
            let time = self.clock.now();
            self.upload_counters(time);
        }

        self.set_state(ClientState::Stopped);

        if let Some(thread) = self.listen_thread.take() {
            drop(thread.join());
        }
    }
}

fn listen_loop(socket: UdpSocket, shared: Arc<Mutex<ListenShared>>, clock: Clock, log: Logger) {
    let mut buffer = [0u8; MAX_PACKET_SIZE];

    loop {
        let received = match socket.recv_from(&mut buffer) {
            Ok((length, from)) => Some((length, Address::from_socket_addr(from))),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(_) => None,
        };

        let timestamp = clock.now();

        let mut shared = shared.lock().unwrap();

        if shared.state == ClientState::Stopped {
            logging::info!(log, "client listen thread stopped");
            break;
        }

        if let Some((length, from)) = received {
            shared
                .queues
                .push(IncomingPacket::new(timestamp, from, &buffer[..length]));
        }
    }
}

fn send_raw(socket: &UdpSocket, to: &Address, packet: &[u8]) {
    if let Some(addr) = to.to_socket_addr() {
        drop(socket.send_to(packet, addr));
    }
}

fn send_migrate_packet(socket: &UdpSocket, log: &Logger, token: &FlowToken, sequence: u64) {
    let mut packet = [0u8; HEADER_BYTES];

    let head = Header {
        packet_type: PacketType::Migrate,
        sequence,
        flow_id: token.flow_id,
        flow_version: token.flow_version,
        flow_flags: token.flow_flags,
    };

    if header::write_header(&head, &token.private_key, &mut packet).is_err() {
        logging::error!(logging::flow(log, token.flow_id, token.flow_version),
                        "failed to write migrate packet header");
        return;
    }

    send_raw(socket, &token.next_address, &packet);

    logging::debug!(logging::flow(log, token.flow_id, token.flow_version),
                    "sent migrate packet"; "to" => token.next_address.to_string());
}

fn send_destroy_packet(socket: &UdpSocket, log: &Logger, token: &FlowToken, sequence: u64) {
    let mut packet = [0u8; HEADER_BYTES];

    let head = Header {
        packet_type: PacketType::Destroy,
        sequence,
        flow_id: token.flow_id,
        flow_version: token.flow_version,
        flow_flags: token.flow_flags,
    };

    if header::write_header(&head, &token.private_key, &mut packet).is_err() {
        logging::error!(logging::flow(log, token.flow_id, token.flow_version),
                        "failed to write destroy packet header");
        return;
    }

    send_raw(socket, &token.next_address, &packet);

    logging::debug!(logging::flow(log, token.flow_id, token.flow_version),
                    "sent destroy packet"; "to" => token.next_address.to_string());
}

/// Validates a routed packet against one route. Mutates the route's
/// replay window on success.
fn route_read_packet_header(
    session_timeout_secs: f64,
    log: &Logger,
    route: &mut ClientRoute,
    timestamp: f64,
    packet: &[u8],
) -> bool {
    if route.time_last_packet_received + session_timeout_secs < timestamp {
        logging::debug!(log, "ignored packet"; "reason" => "session timed out");
        return false;
    }

    let head = match header::read_header(&route.flow_token.private_key, packet) {
        Ok(head) => head,
        Err(_) => {
            logging::debug!(log, "client ignored packet"; "reason" => "failed to read header");
            return false;
        }
    };

    if head.flow_id != route.flow_token.flow_id {
        logging::debug!(log, "client ignored packet"; "reason" => "wrong flow id",
                        "flow_id" => format!("{:016x}", head.flow_id));
        return false;
    }

    if head.flow_version != route.flow_token.flow_version {
        logging::debug!(log, "client ignored packet"; "reason" => "bad flow version");
        return false;
    }

    if route.replay_protection.already_received(head.sequence) {
        logging::debug!(log, "client ignored packet"; "reason" => "already received");
        return false;
    }

    true
}
