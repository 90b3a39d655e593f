use crate::ping::RouteStats;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use magnetite::address::{Address, ADDRESS_BYTES};
use magnetite::crypto;
use magnetite::prefix::RoutePrefix;
use magnetite::token::SEALED_FLOW_TOKEN_BYTES;
use magnetite::{WireError, WireResult};
use serde_derive::{Deserialize, Serialize};
use std::io::Read;
use std::str::FromStr;

pub const ROUTER_ROUTE_PATH: &str = "/v2/router/route";
pub const ROUTER_UPDATE_PATH: &str = "/v2/router/update";
pub const STATS_COUNTERS_PATH: &str = "/v2/stats/counters";
pub const STATS_LOG_PATH: &str = "/v2/stats/log";

pub const HTTP_TIMEOUT_INITIAL_ROUTE_MS: u32 = 10_000;
pub const HTTP_TIMEOUT_ROUTE_UPDATE_MS: u32 = 2_000;
pub const HTTP_TIMEOUT_NEAR_RELAYS_MS: u32 = 5_000;
pub const HTTP_TIMEOUT_COUNTERS_MS: u32 = 10_000;

/// Upper bound on the opaque route state blob inside a route install.
pub const ROUTE_STATE_MAX_BYTES: usize = 1500;

pub const MAX_NEAR_RELAYS: usize = 10;
pub const MAX_RELAY_HOPS: usize = 5;
pub const MAX_FLOW_TOKENS: usize = MAX_RELAY_HOPS + 2;

/// Version tag at the head of the binary client info blob.
pub const CLIENT_INFO_VERSION: u32 = 2;

/// A completed controller exchange, surfaced by `Controller::poll`.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    NearRelays { status: u16, body: String },
    InitialRoute { status: u16, body: String },
    RouteUpdate { status: u16, body: String },
}

/// The HTTP transport to the route controller, owned by the embedding
/// application. Requests are fire and forget; completions come back from
/// `poll` on the update thread, so no callback ever runs concurrently with
/// the client.
pub trait Controller {
    fn get_near_relays(&mut self, path: &str, timeout_ms: u32);
    fn post_initial_route(&mut self, path: &str, body: &str, timeout_ms: u32);
    fn post_route_update(&mut self, path: &str, body: &str, timeout_ms: u32);
    fn post_counters(&mut self, path: &str, body: &str, timeout_ms: u32);
    fn post_log(&mut self, path: &str, body: &str, timeout_ms: u32);

    /// Drains completed exchanges. Called once per client update.
    fn poll(&mut self) -> Vec<ControllerEvent>;

    /// Abandons every in-flight request. Responses arriving afterwards
    /// must not be surfaced.
    fn cancel_all(&mut self);
}

/// Path for the near relay query, either geolocated automatically or
/// pinned to an override location.
pub fn near_relays_path(location: Option<(f32, f32)>) -> String {
    match location {
        Some((latitude, longitude)) => format!("/v2/near/{:.4}/{:.4}", latitude, longitude),
        None => "/v2/near/auto".to_owned(),
    }
}

/// Derives a relay id from its name (fnv1a-64).
pub fn relay_id(name: &str) -> u64 {
    let mut hash: u64 = 0xCBF2_9CE4_8422_2325;

    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }

    hash
}

// ---------------------------------------------------------------------
// JSON envelopes
// ---------------------------------------------------------------------

/// Body of the periodic route update posted to the controller.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteUpdateRequest {
    pub route_state: String,
    pub server_token: String,
    pub client_info: String,
    pub mode: i32,
}

/// Response to both the initial route request and the periodic update.
/// Carries either fresh route data, continue data extending the current
/// route, or neither.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RouteUpdateResponse {
    pub route_data: Option<String>,
    pub continue_data: Option<String>,
    pub route_relays: Option<String>,
    pub relays: Option<Vec<NearRelayJson>>,
    #[serde(rename = "IP")]
    pub ip: Option<String>,
}

/// Near relay response document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NearRelaysResponse {
    pub relays: Vec<NearRelayJson>,
    #[serde(rename = "IP", default)]
    pub ip: Option<String>,
}

/// One relay entry as it appears in controller JSON: the address is a
/// base64 coded address string and the token is an opaque ping token the
/// data plane carries but never opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NearRelayJson {
    pub id: u64,
    pub token: String,
    pub address: String,
}

/// A candidate first hop relay.
#[derive(Debug, Clone)]
pub struct NearRelay {
    pub id: u64,
    pub address: Address,
    pub ping_token: Vec<u8>,
}

/// Converts decoded JSON relay entries, dropping malformed ones and
/// capping the list at `MAX_NEAR_RELAYS`.
pub fn convert_relays(entries: &[NearRelayJson]) -> Vec<NearRelay> {
    let mut relays = Vec::new();

    for entry in entries {
        if relays.len() >= MAX_NEAR_RELAYS {
            break;
        }

        let address_string = match base64::decode(&entry.address) {
            Ok(raw) => match String::from_utf8(raw) {
                Ok(string) => string,
                Err(_) => continue,
            },
            Err(_) => continue,
        };

        let address = match Address::from_str(&address_string) {
            Ok(address) => address,
            Err(_) => continue,
        };

        let ping_token = match base64::decode(&entry.token) {
            Ok(token) => token,
            Err(_) => continue,
        };

        relays.push(NearRelay {
            id: entry.id,
            address,
            ping_token,
        });
    }

    relays
}

/// Parses a near relay response body into relays plus the client's public
/// IP as observed by the controller.
pub fn parse_near_relays(body: &str) -> Result<(Vec<NearRelay>, Address), serde_json::Error> {
    let response: NearRelaysResponse = serde_json::from_str(body)?;

    let public_ip = response
        .ip
        .as_ref()
        .and_then(|ip| base64::decode(ip).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|string| Address::from_str(&string).ok())
        .unwrap_or(Address::None);

    Ok((convert_relays(&response.relays), public_ip))
}

/// Body of the signed insecure session request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitialRouteRequest {
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub user_id: u64,
    pub platform_id: u32,
    pub acceptable_latency: f32,
    pub acceptable_jitter: f32,
    pub acceptable_packet_loss: f32,
    pub dest_relay: u64,
    pub server_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price_per_gig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_price_per_gig: Option<String>,
    pub mode: i32,
    pub server_address: String,
    pub client_info: String,
}

/// Wrapper around the initial route request: the customer id, the inner
/// request as base64 and a detached signature over the inner JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignedRequest {
    pub customer_id: u64,
    #[serde(rename = "HMAC")]
    pub hmac: String,
    pub route_request: String,
}

/// Signs the inner request body with the customer's signing key.
pub fn sign_request(
    request_json: &str,
    customer_id: u64,
    customer_private_key: &[u8; crypto::SIGN_SECRET_KEY_SIZE],
) -> SignedRequest {
    let signature = crypto::sign(request_json.as_bytes(), customer_private_key);

    SignedRequest {
        customer_id,
        hmac: base64::encode(&signature[..]),
        route_request: base64::encode(request_json.as_bytes()),
    }
}

/// Counter upload body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CounterUpload {
    pub counters: Vec<u64>,
}

/// Log upload body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogUpload {
    pub flow_id: u64,
    pub level: i32,
    pub message: String,
}

// ---------------------------------------------------------------------
// Binary blobs
// ---------------------------------------------------------------------

/// Per relay statistics inside the client info blob.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RelayStat {
    pub id: u64,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

/// The binary client info blob posted inside route requests and updates.
/// The public key rides along only on the initial request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub time: f64,
    pub relay: RouteStats,
    pub direct: RouteStats,
    pub relay_stats: Vec<RelayStat>,
    pub public_ip: Address,
    pub public_key: Option<[u8; crypto::BOX_PUBLIC_KEY_SIZE]>,
}

impl ClientInfo {
    pub fn write(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(
            4 + 8 + 6 * 4 + 4 + self.relay_stats.len() * 20 + ADDRESS_BYTES + 32,
        );

        buffer.write_u32::<LittleEndian>(CLIENT_INFO_VERSION).unwrap();
        buffer.write_f64::<LittleEndian>(self.time).unwrap();

        buffer.write_f32::<LittleEndian>(self.relay.rtt).unwrap();
        buffer.write_f32::<LittleEndian>(self.relay.jitter).unwrap();
        buffer.write_f32::<LittleEndian>(self.relay.packet_loss).unwrap();

        buffer.write_f32::<LittleEndian>(self.direct.rtt).unwrap();
        buffer.write_f32::<LittleEndian>(self.direct.jitter).unwrap();
        buffer.write_f32::<LittleEndian>(self.direct.packet_loss).unwrap();

        buffer
            .write_u32::<LittleEndian>(self.relay_stats.len() as u32)
            .unwrap();

        for stat in &self.relay_stats {
            buffer.write_u64::<LittleEndian>(stat.id).unwrap();
            buffer.write_f32::<LittleEndian>(stat.rtt).unwrap();
            buffer.write_f32::<LittleEndian>(stat.jitter).unwrap();
            buffer.write_f32::<LittleEndian>(stat.packet_loss).unwrap();
        }

        self.public_ip.write(&mut buffer).unwrap();

        if let Some(public_key) = &self.public_key {
            buffer.extend_from_slice(public_key);
        }

        buffer
    }

    pub fn read(buffer: &[u8]) -> WireResult<ClientInfo> {
        let mut stream = buffer;

        let version = stream.read_u32::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        if version != CLIENT_INFO_VERSION {
            return Err(WireError::UnknownType);
        }

        let time = stream.read_f64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;

        let mut read_stats = |stream: &mut &[u8]| -> WireResult<RouteStats> {
            Ok(RouteStats {
                rtt: stream.read_f32::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
                jitter: stream.read_f32::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
                packet_loss: stream.read_f32::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
            })
        };

        let relay = read_stats(&mut stream)?;
        let direct = read_stats(&mut stream)?;

        let relay_count = stream.read_u32::<LittleEndian>().map_err(|_| WireError::TooSmall)? as usize;
        if relay_count > MAX_NEAR_RELAYS {
            return Err(WireError::TooLarge);
        }

        let mut relay_stats = Vec::with_capacity(relay_count);
        for _ in 0..relay_count {
            relay_stats.push(RelayStat {
                id: stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
                rtt: stream.read_f32::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
                jitter: stream.read_f32::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
                packet_loss: stream.read_f32::<LittleEndian>().map_err(|_| WireError::TooSmall)?,
            });
        }

        let public_ip = Address::read(&mut stream).map_err(|_| WireError::TooSmall)?;

        let public_key = if stream.is_empty() {
            None
        } else {
            let mut key = [0u8; crypto::BOX_PUBLIC_KEY_SIZE];
            stream.read_exact(&mut key).map_err(|_| WireError::TooSmall)?;
            Some(key)
        };

        Ok(ClientInfo {
            time,
            relay,
            direct,
            relay_stats,
            public_ip,
            public_key,
        })
    }
}

/// The decoded binary route blob: prefix, opaque route state and the
/// sealed token chain (flow tokens on an install, continue tokens on a
/// continue).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RouteData {
    pub prefix: RoutePrefix,
    pub route_state: Vec<u8>,
    pub tokens: Vec<u8>,
}

/// Parses a route blob. The prefix always parses first; the route state is
/// bounded; everything after it is the token chain.
pub fn read_route_data(data: &[u8]) -> WireResult<RouteData> {
    let mut stream = data;

    let prefix = RoutePrefix::read(&mut stream)?;

    if stream.len() < 4 {
        return Err(WireError::TooSmall);
    }

    let route_state_bytes = LittleEndian::read_u32(&stream[..4]) as usize;
    stream = &stream[4..];

    if route_state_bytes > ROUTE_STATE_MAX_BYTES {
        return Err(WireError::TooLarge);
    }

    if stream.len() < route_state_bytes {
        return Err(WireError::TooSmall);
    }

    let route_state = stream[..route_state_bytes].to_vec();
    let tokens = stream[route_state_bytes..].to_vec();

    if tokens.len() > MAX_FLOW_TOKENS * SEALED_FLOW_TOKEN_BYTES {
        return Err(WireError::TooLarge);
    }

    Ok(RouteData {
        prefix,
        route_state,
        tokens,
    })
}

/// Builds a route blob in its wire form.
pub fn write_route_data(
    prefix: &RoutePrefix,
    route_state: &[u8],
    tokens: &[u8],
) -> WireResult<Vec<u8>> {
    if route_state.len() > ROUTE_STATE_MAX_BYTES {
        return Err(WireError::TooLarge);
    }

    let mut buffer = Vec::with_capacity(32 + route_state.len() + tokens.len());

    prefix.write(&mut buffer)?;
    buffer.write_u32::<LittleEndian>(route_state.len() as u32).unwrap();
    buffer.extend_from_slice(route_state);
    buffer.extend_from_slice(tokens);

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info_roundtrip() {
        let info = ClientInfo {
            time: 1234.5,
            relay: RouteStats {
                rtt: 20.0,
                jitter: 1.5,
                packet_loss: 0.0,
            },
            direct: RouteStats {
                rtt: 30.0,
                jitter: 2.5,
                packet_loss: 0.01,
            },
            relay_stats: vec![
                RelayStat {
                    id: 7,
                    rtt: 11.0,
                    jitter: 0.5,
                    packet_loss: 0.0,
                },
                RelayStat {
                    id: 8,
                    rtt: 12.0,
                    jitter: 0.25,
                    packet_loss: 0.0,
                },
            ],
            public_ip: Address::Ipv4 {
                ip: [1, 2, 3, 4],
                port: 0,
            },
            public_key: Some([9u8; 32]),
        };

        assert_eq!(ClientInfo::read(&info.write()).unwrap(), info);
    }

    #[test]
    fn test_client_info_roundtrip_without_key() {
        let info = ClientInfo {
            time: 0.0,
            relay: RouteStats::no_data(),
            direct: RouteStats::no_data(),
            relay_stats: Vec::new(),
            public_ip: Address::None,
            public_key: None,
        };

        assert_eq!(ClientInfo::read(&info.write()).unwrap(), info);
    }

    #[test]
    fn test_client_info_err_bad_version() {
        let mut blob = ClientInfo {
            time: 0.0,
            relay: RouteStats::no_data(),
            direct: RouteStats::no_data(),
            relay_stats: Vec::new(),
            public_ip: Address::None,
            public_key: None,
        }
        .write();

        blob[0] = 99;

        assert_eq!(ClientInfo::read(&blob), Err(WireError::UnknownType));
    }

    #[test]
    fn test_route_data_roundtrip() {
        let prefix = RoutePrefix::ServerAddress(Address::Ipv4 {
            ip: [10, 0, 0, 1],
            port: 5000,
        });
        let route_state = vec![1u8; 100];
        let tokens = vec![2u8; SEALED_FLOW_TOKEN_BYTES * 2];

        let blob = write_route_data(&prefix, &route_state, &tokens).unwrap();
        let parsed = read_route_data(&blob).unwrap();

        assert_eq!(parsed.prefix, prefix);
        assert_eq!(parsed.route_state, route_state);
        assert_eq!(parsed.tokens, tokens);
    }

    #[test]
    fn test_route_data_err_oversized_state() {
        let mut blob = Vec::new();
        RoutePrefix::Null.write(&mut blob).unwrap();
        blob.write_u32::<LittleEndian>(ROUTE_STATE_MAX_BYTES as u32 + 1).unwrap();
        blob.extend_from_slice(&vec![0u8; ROUTE_STATE_MAX_BYTES + 1]);

        assert_eq!(read_route_data(&blob), Err(WireError::TooLarge));
    }

    #[test]
    fn test_route_data_err_truncated_state() {
        let mut blob = Vec::new();
        RoutePrefix::Null.write(&mut blob).unwrap();
        blob.write_u32::<LittleEndian>(100).unwrap();
        blob.extend_from_slice(&[0u8; 50]);

        assert_eq!(read_route_data(&blob), Err(WireError::TooSmall));
    }

    #[test]
    fn test_parse_near_relays() {
        let address_b64 = base64::encode("10.0.0.1:40000");
        let token_b64 = base64::encode(&[1u8, 2, 3]);
        let ip_b64 = base64::encode("99.88.77.66:0");

        let body = format!(
            r#"{{"Relays": [{{"Id": 7, "Token": "{}", "Address": "{}"}}], "IP": "{}"}}"#,
            token_b64, address_b64, ip_b64
        );

        let (relays, public_ip) = parse_near_relays(&body).unwrap();

        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].id, 7);
        assert_eq!(
            relays[0].address,
            Address::Ipv4 {
                ip: [10, 0, 0, 1],
                port: 40000
            }
        );
        assert_eq!(relays[0].ping_token, vec![1, 2, 3]);
        assert_eq!(
            public_ip,
            Address::Ipv4 {
                ip: [99, 88, 77, 66],
                port: 0
            }
        );
    }

    #[test]
    fn test_parse_near_relays_skips_malformed() {
        let good_address = base64::encode("10.0.0.1:40000");
        let token = base64::encode(&[0u8]);

        let body = format!(
            r#"{{"Relays": [
                {{"Id": 1, "Token": "{}", "Address": "not base64!!"}},
                {{"Id": 2, "Token": "{}", "Address": "{}"}}
            ]}}"#,
            token, token, good_address
        );

        let (relays, _) = parse_near_relays(&body).unwrap();

        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].id, 2);
    }

    #[test]
    fn test_sign_request_verifies() {
        magnetite::crypto::init();

        let (public_key, private_key) = crypto::generate_sign_keypair();

        let body = r#"{"KbpsUp": 256}"#;
        let signed = sign_request(body, 42, &private_key);

        assert_eq!(signed.customer_id, 42);
        assert_eq!(base64::decode(&signed.route_request).unwrap(), body.as_bytes());

        let signature_raw = base64::decode(&signed.hmac).unwrap();
        let mut signature = [0u8; crypto::SIGNATURE_SIZE];
        signature.copy_from_slice(&signature_raw);

        assert!(crypto::sign_verify(&signature, body.as_bytes(), &public_key));
    }

    #[test]
    fn test_relay_id_is_fnv1a() {
        // Well known fnv1a-64 vectors.
        assert_eq!(relay_id(""), 0xCBF2_9CE4_8422_2325);
        assert_eq!(relay_id("a"), 0xAF63_DC4C_8601_EC8C);
    }

    #[test]
    fn test_near_relays_path() {
        assert_eq!(near_relays_path(None), "/v2/near/auto");
        assert_eq!(near_relays_path(Some((1.5, -2.25))), "/v2/near/1.5000/-2.2500");
    }

    #[test]
    fn test_counter_upload_shape() {
        let upload = CounterUpload {
            counters: vec![0, 1, 2],
        };

        assert_eq!(serde_json::to_string(&upload).unwrap(), r#"{"Counters":[0,1,2]}"#);
    }

    #[test]
    fn test_route_update_response_parse() {
        let body = r#"{"RouteData": "abcd", "RouteRelays": "a - b - c"}"#;
        let response: RouteUpdateResponse = serde_json::from_str(body).unwrap();

        assert_eq!(response.route_data.as_deref(), Some("abcd"));
        assert_eq!(response.route_relays.as_deref(), Some("a - b - c"));
        assert!(response.continue_data.is_none());
        assert!(response.relays.is_none());
    }
}
