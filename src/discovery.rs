/// FlexRadio LAN discovery.
///
/// Radios announce themselves with a VITA `EXT_DATA_WITH_STREAM_ID`
/// broadcast on UDP 4992 (packet class `0xFFFF`, FlexRadio OUI) whose
/// payload is a whitespace-delimited `key=value` token string.
use crate::transport_vita::bind_reuseaddr;
use crate::vita::{
    self, FLEX_OUI, MAX_PACKET_LEN, VITA_CLASS_ID_PACKET_CLASS_MASK, VITA_DATA_HEADER_SIZE,
    VITA_HEADER_PACKET_TYPE_MASK, VITA_PACKET_TYPE_EXT_DATA_WITH_STREAM_ID,
};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Discovery broadcasts share the command port number, UDP instead of TCP.
pub const DISCOVERY_PORT: u16 = 4992;

/// Packet-class low word that marks a discovery packet.
const DISCOVERY_PACKET_CLASS: u32 = 0xffff;

/// One discovered radio, fields straight from the announcement tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Radio {
    pub discovery_protocol_version: String,
    pub model: String,
    pub serial: String,
    pub version: String,
    pub nickname: String,
    pub callsign: String,
    pub ip: String,
    pub port: String,
    pub status: String,
}

impl fmt::Display for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "discovery_protocol_version={} model={} serial={} version={} nickname={} callsign={} ip={} port={} status={}",
            self.discovery_protocol_version,
            self.model,
            self.serial,
            self.version,
            self.nickname,
            self.callsign,
            self.ip,
            self.port,
            self.status
        )
    }
}

/// Split a token string into its `key=value` pairs. Tokens without exactly
/// one `=` are dropped.
pub fn detokenize(token_string: &str) -> HashMap<&str, &str> {
    let mut tokens = HashMap::new();
    for seg in token_string.split_whitespace() {
        let parts: Vec<&str> = seg.split('=').collect();
        if parts.len() == 2 {
            tokens.insert(parts[0], parts[1]);
        }
    }
    tokens
}

/// Validate and parse one discovery datagram into a [`Radio`].
pub fn parse_discovery_packet(buf: &[u8]) -> anyhow::Result<Radio> {
    let header = vita::read_header(buf).ok_or_else(|| anyhow!("discovery packet too short"))?;

    if header.class_id_h != FLEX_OUI {
        bail!("wrong OUI {:08x}", header.class_id_h);
    }
    if header.header & VITA_HEADER_PACKET_TYPE_MASK != VITA_PACKET_TYPE_EXT_DATA_WITH_STREAM_ID {
        bail!("wrong packet type {:08x}", header.header);
    }
    if header.class_id_l & VITA_CLASS_ID_PACKET_CLASS_MASK != DISCOVERY_PACKET_CLASS {
        bail!("wrong packet class {:08x}", header.class_id_l);
    }

    let payload = String::from_utf8_lossy(&buf[VITA_DATA_HEADER_SIZE..]);
    let mut radio = Radio::default();
    for (k, v) in detokenize(payload.trim_end_matches('\0')) {
        match k {
            "discovery_protocol_version" => radio.discovery_protocol_version = v.to_string(),
            "model" => radio.model = v.to_string(),
            "serial" => radio.serial = v.to_string(),
            "version" => radio.version = v.to_string(),
            "nickname" => radio.nickname = v.to_string(),
            "callsign" => radio.callsign = v.to_string(),
            "ip" => radio.ip = v.to_string(),
            "port" => radio.port = v.to_string(),
            "status" => radio.status = v.to_string(),
            _ => {}
        }
    }
    Ok(radio)
}

/// Listen on the discovery port until one valid announcement arrives or
/// the timeout expires. Malformed datagrams are logged and skipped; a
/// socket error ends the wait with exactly one terminal outcome.
pub async fn discover_radio(timeout: Duration) -> anyhow::Result<Radio> {
    let local: SocketAddr = ([0, 0, 0, 0], DISCOVERY_PORT).into();
    let socket = bind_reuseaddr(local)?;
    debug!(port = DISCOVERY_PORT, "discovery listener bound");

    let listen = async {
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await?;
            match parse_discovery_packet(&buf[..n]) {
                Ok(radio) => return anyhow::Ok(radio),
                Err(e) => warn!(src = %src, error = %e, "ignoring discovery datagram"),
            }
        }
    };

    match tokio::time::timeout(timeout, listen).await {
        Ok(result) => result,
        Err(_) => bail!("no radio discovered within {timeout:?}"),
    }
}
