//! Minimal strongSwan VICI client.
//!
//! There is no maintained VICI crate in the ecosystem, so this is hand-rolled
//! the same way the daemon crate hand-rolls its QMP client in `qmp.rs`: a
//! length-prefixed binary protocol over a Unix socket, one `Session` guarding
//! a single connection behind a mutex.
//!
//! Wire format (see strongSwan's `libvici/README`): every packet is a 4-byte
//! big-endian length followed by a 1-byte message type, then a sequence of
//! TLV-ish elements (section start/end, key-value, list start/item/end).
//! Only the element kinds the daemon actually sends/receives are
//! implemented: flat key-value maps, one level of nested sections and
//! string lists — enough for `list-sas`, `load-conn`, `initiate`, and
//! `terminate`.

use std::collections::BTreeMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const CMD_REQUEST: u8 = 0;
const CMD_RESPONSE: u8 = 1;
const CMD_UNKNOWN: u8 = 2;
const EVENT_REGISTER: u8 = 3;
const EVENT_UNREGISTER: u8 = 4;
const EVENT: u8 = 5;

const SECTION_START: u8 = 1;
const SECTION_END: u8 = 2;
const KEY_VALUE: u8 = 3;
const LIST_START: u8 = 4;
const LIST_ITEM: u8 = 5;
const LIST_END: u8 = 6;

/// A decoded VICI message: an ordered map from key to either a scalar, a
/// list of scalars, or a nested section. Good enough to represent
/// `list-sas` responses and the requests the daemon issues.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub fields: Vec<(String, Field)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Value(Vec<u8>),
    List(Vec<Vec<u8>>),
    Section(Message),
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kv(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push((key.to_string(), Field::Value(value.into())));
        self
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.fields.iter().find_map(|(k, v)| {
            if k == key {
                match v {
                    Field::Value(b) => Some(String::from_utf8_lossy(b).into_owned()),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    pub fn get_section(&self, key: &str) -> Option<&Message> {
        self.fields.iter().find_map(|(k, v)| {
            if k == key {
                match v {
                    Field::Section(m) => Some(m),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Message)> {
        self.fields.iter().filter_map(|(k, v)| match v {
            Field::Section(m) => Some((k.as_str(), m)),
            _ => None,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        for (key, field) in &self.fields {
            match field {
                Field::Value(v) => {
                    buf.push(KEY_VALUE);
                    buf.push(key.len() as u8);
                    buf.extend_from_slice(key.as_bytes());
                    buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
                    buf.extend_from_slice(v);
                }
                Field::List(items) => {
                    buf.push(LIST_START);
                    buf.push(key.len() as u8);
                    buf.extend_from_slice(key.as_bytes());
                    for item in items {
                        buf.push(LIST_ITEM);
                        buf.extend_from_slice(&(item.len() as u16).to_be_bytes());
                        buf.extend_from_slice(item);
                    }
                    buf.push(LIST_END);
                }
                Field::Section(inner) => {
                    buf.push(SECTION_START);
                    buf.push(key.len() as u8);
                    buf.extend_from_slice(key.as_bytes());
                    inner.encode(buf);
                    buf.push(SECTION_END);
                }
            }
        }
    }

    fn decode(cursor: &mut &[u8]) -> Result<Self> {
        let mut msg = Message::new();
        while let Some(&tag) = cursor.first() {
            *cursor = &cursor[1..];
            match tag {
                SECTION_END | LIST_END => break,
                SECTION_START => {
                    let key = read_short_str(cursor)?;
                    let section = Message::decode(cursor)?;
                    msg.fields.push((key, Field::Section(section)));
                }
                KEY_VALUE => {
                    let key = read_short_str(cursor)?;
                    let value = read_blob(cursor)?;
                    msg.fields.push((key, Field::Value(value)));
                }
                LIST_START => {
                    let key = read_short_str(cursor)?;
                    let mut items = Vec::new();
                    loop {
                        let Some(&item_tag) = cursor.first() else {
                            return Err(Error::Vici("truncated list".into()));
                        };
                        *cursor = &cursor[1..];
                        if item_tag == LIST_END {
                            break;
                        }
                        if item_tag != LIST_ITEM {
                            return Err(Error::Vici(format!("unexpected list element {item_tag}")));
                        }
                        items.push(read_blob(cursor)?);
                    }
                    msg.fields.push((key, Field::List(items)));
                }
                other => return Err(Error::Vici(format!("unknown element tag {other}"))),
            }
        }
        Ok(msg)
    }
}

fn read_short_str(cursor: &mut &[u8]) -> Result<String> {
    let len = *cursor.first().ok_or_else(|| Error::Vici("truncated key".into()))? as usize;
    *cursor = &cursor[1..];
    if cursor.len() < len {
        return Err(Error::Vici("truncated key".into()));
    }
    let s = String::from_utf8_lossy(&cursor[..len]).into_owned();
    *cursor = &cursor[len..];
    Ok(s)
}

fn read_blob(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.len() < 2 {
        return Err(Error::Vici("truncated value length".into()));
    }
    let len = u16::from_be_bytes([cursor[0], cursor[1]]) as usize;
    *cursor = &cursor[2..];
    if cursor.len() < len {
        return Err(Error::Vici("truncated value".into()));
    }
    let v = cursor[..len].to_vec();
    *cursor = &cursor[len..];
    Ok(v)
}

/// A connection to `charon`'s VICI socket, normally `/var/run/charon.vici`
/// inside the EXTERNAL network instance.
pub struct Session {
    stream: Mutex<UnixStream>,
}

impl Session {
    pub async fn connect(socket_path: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::ExternalServiceUnavailable(format!("vici: {e}")))?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    async fn write_packet(stream: &mut UnixStream, msg_type: u8, body: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(body.len() + 1);
        packet.push(msg_type);
        packet.extend_from_slice(body);
        stream
            .write_all(&(packet.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&packet).await?;
        Ok(())
    }

    async fn read_packet(stream: &mut UnixStream) -> Result<(u8, Vec<u8>)> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        if body.is_empty() {
            return Err(Error::Vici("empty packet".into()));
        }
        Ok((body[0], body[1..].to_vec()))
    }

    /// Issues a named command and returns the decoded response section.
    pub async fn request(&self, name: &str, args: Message) -> Result<Message> {
        let mut stream = self.stream.lock().await;

        let mut body = Vec::new();
        body.push(name.len() as u8);
        body.extend_from_slice(name.as_bytes());
        args.encode(&mut body);
        Self::write_packet(&mut stream, CMD_REQUEST, &body).await?;

        let (msg_type, payload) = Self::read_packet(&mut stream).await?;
        match msg_type {
            CMD_RESPONSE => Message::decode(&mut payload.as_slice()),
            CMD_UNKNOWN => Err(Error::Vici(format!("unknown command: {name}"))),
            other => Err(Error::Vici(format!("unexpected response type {other}"))),
        }
    }

    /// `list-sas`: streams one event per IKE_SA. VICI streams these as a
    /// named event rather than a single response, so this registers for
    /// the event, issues the request, and collects events until the final
    /// `CMD_RESPONSE` arrives.
    pub async fn list_sas(&self, filter: Message) -> Result<Vec<Message>> {
        let mut stream = self.stream.lock().await;

        let mut reg = Vec::new();
        reg.push(b"list-sa".len() as u8);
        reg.extend_from_slice(b"list-sa");
        Self::write_packet(&mut stream, EVENT_REGISTER, &reg).await?;
        let (t, _) = Self::read_packet(&mut stream).await?;
        if t != CMD_RESPONSE {
            return Err(Error::Vici("list-sa event registration failed".into()));
        }

        let mut body = Vec::new();
        body.push("list-sas".len() as u8);
        body.extend_from_slice(b"list-sas");
        filter.encode(&mut body);
        Self::write_packet(&mut stream, CMD_REQUEST, &body).await?;

        let mut sas = Vec::new();
        loop {
            let (msg_type, payload) = Self::read_packet(&mut stream).await?;
            match msg_type {
                EVENT => sas.push(Message::decode(&mut payload.as_slice())?),
                CMD_RESPONSE => break,
                other => return Err(Error::Vici(format!("unexpected message type {other}"))),
            }
        }

        let mut unreg = Vec::new();
        unreg.push(b"list-sa".len() as u8);
        unreg.extend_from_slice(b"list-sa");
        Self::write_packet(&mut stream, EVENT_UNREGISTER, &unreg).await?;
        let _ = Self::read_packet(&mut stream).await?;

        Ok(sas)
    }

    /// `terminate`: ends an IKE or CHILD SA by unique id.
    pub async fn terminate_sa(&self, ike_id: Option<u32>, child_id: Option<u32>) -> Result<()> {
        let mut args = Message::new();
        if let Some(id) = ike_id {
            args = args.kv("ike-id", id.to_string().into_bytes());
        }
        if let Some(id) = child_id {
            args = args.kv("child-id", id.to_string().into_bytes());
        }
        let response = self.request("terminate", args).await?;
        if let Some(success) = response.get_str("success") {
            if success != "yes" {
                let errmsg = response.get_str("errmsg").unwrap_or_default();
                return Err(Error::Vici(format!("terminate failed: {errmsg}")));
            }
        }
        Ok(())
    }

    /// Registers for a named event stream (`ike-updown`, `child-updown`,
    /// ...). The SA monitor registers for both up front, then multiplexes
    /// on the event name `next_event` returns rather than opening one
    /// session per event type.
    pub async fn register_event(&self, name: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let mut reg = Vec::new();
        reg.push(name.len() as u8);
        reg.extend_from_slice(name.as_bytes());
        Self::write_packet(&mut stream, EVENT_REGISTER, &reg).await?;
        let (t, _) = Self::read_packet(&mut stream).await?;
        if t != CMD_RESPONSE {
            return Err(Error::Vici(format!("event registration failed for {name}")));
        }
        Ok(())
    }

    /// Blocks until the next `EVENT` packet arrives on this session and
    /// returns its event name plus decoded body. Must not be called
    /// concurrently with [`Session::request`]/[`Session::list_sas`] on the
    /// same `Session` — the monitor keeps a dedicated `Session` just for
    /// event listening, never reusing the one issuing commands.
    pub async fn next_event(&self) -> Result<(String, Message)> {
        let mut stream = self.stream.lock().await;
        loop {
            let (msg_type, payload) = Self::read_packet(&mut stream).await?;
            if msg_type == EVENT {
                let mut cursor = payload.as_slice();
                let name = read_short_str(&mut cursor)?;
                let msg = Message::decode(&mut cursor)?;
                return Ok((name, msg));
            }
        }
    }

    /// `initiate`: starts an IKE_SA by connection name.
    pub async fn initiate(&self, child: &str) -> Result<()> {
        let args = Message::new().kv("child", child.as_bytes().to_vec());
        let response = self.request("initiate", args).await?;
        if response.get_str("success").as_deref() != Some("yes") {
            let errmsg = response.get_str("errmsg").unwrap_or_default();
            return Err(Error::Vici(format!("initiate failed for {child}: {errmsg}")));
        }
        Ok(())
    }
}

/// Convenience view over a decoded `list-sas` event: one IKE_SA keyed by
/// its connection name, with `established`/`uniqueid` pulled out, plus its
/// CHILD_SAs keyed by name.
pub struct IkeSa<'a> {
    pub name: String,
    pub fields: &'a Message,
}

impl<'a> IkeSa<'a> {
    pub fn from_event(event: &'a Message) -> Option<Self> {
        let (name, fields) = event.sections().next()?;
        Some(IkeSa {
            name: name.to_string(),
            fields,
        })
    }

    pub fn uniqueid(&self) -> Option<u32> {
        self.fields.get_str("uniqueid")?.parse().ok()
    }

    pub fn established(&self) -> Option<i64> {
        self.fields.get_str("established")?.parse().ok()
    }

    pub fn child_sas(&self) -> BTreeMap<String, &Message> {
        self.fields
            .get_section("child-sas")
            .map(|s| s.sections().map(|(k, v)| (k.to_string(), v)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_flat_message() {
        let msg = Message::new().kv("ike", b"c0001-00-0".to_vec());
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        let decoded = Message::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.get_str("ike").as_deref(), Some("c0001-00-0"));
    }

    #[test]
    fn roundtrips_nested_section() {
        let inner = Message::new().kv("uniqueid", b"42".to_vec());
        let msg = Message {
            fields: vec![("c0001-00-0".to_string(), Field::Section(inner))],
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        let decoded = Message::decode(&mut buf.as_slice()).unwrap();
        let sa = IkeSa::from_event(&decoded).unwrap();
        assert_eq!(sa.name, "c0001-00-0");
        assert_eq!(sa.uniqueid(), Some(42));
    }
}
