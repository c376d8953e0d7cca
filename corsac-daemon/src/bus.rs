/*!
 * Bus Event Source
 * System-bus connection wrapper and typed signal stream
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dbus::arg::{ArgType, PropMap, RefArg};
use dbus::channel::MatchingReceiver;
use dbus::message::{MatchRule, Message};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{Proxy, SyncConnection};
use tokio::sync::mpsc;

use crate::error::{DaemonError, Result};

const METHOD_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded managed-object tree: path -> interface -> property -> value.
pub type ObjectMap = HashMap<String, HashMap<String, HashMap<String, PropValue>>>;

/// A property value decoded into an owned representation at the bus
/// boundary. D-Bus argument handles cannot cross task boundaries, so
/// every signal payload is converted once, here, and routed as plain data.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Str(String),
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Map(HashMap<String, PropValue>),
    List(Vec<PropValue>),
    Other,
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropValue::Uint(v) => Some(*v),
            PropValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, PropValue>> {
        match self {
            PropValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// A raw bus notification tagged with its source path and a process-wide
/// monotonic sequence number. Consumed exactly once by the event router.
#[derive(Debug, Clone)]
pub enum BusEvent {
    ObjectAdded {
        seq: u64,
        path: String,
        interfaces: HashMap<String, HashMap<String, PropValue>>,
    },
    ObjectRemoved {
        seq: u64,
        path: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        seq: u64,
        path: String,
        interface: String,
        changed: HashMap<String, PropValue>,
    },
    CallAdded {
        seq: u64,
        call: String,
        properties: HashMap<String, PropValue>,
    },
    CallRemoved {
        seq: u64,
        call: String,
    },
    CallPropertyChanged {
        seq: u64,
        call: String,
        name: String,
        value: PropValue,
    },
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// One connection to the system bus, driven by its own I/O task.
pub struct Bus {
    conn: Arc<SyncConnection>,
}

impl Bus {
    /// Connect to the system bus and spawn the connection's event loop.
    pub async fn connect_system() -> Result<Self> {
        let (resource, conn) =
            dbus_tokio::connection::new_system_sync().map_err(DaemonError::BusUnavailable)?;

        tokio::spawn(async move {
            let err = resource.await;
            tracing::error!("Lost connection to the system bus: {}", err);
        });

        Ok(Self { conn })
    }

    pub fn connection(&self) -> Arc<SyncConnection> {
        self.conn.clone()
    }

    pub fn proxy(&self, service: &str, path: &str) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(
            service.to_string(),
            path.to_string(),
            METHOD_TIMEOUT,
            self.conn.clone(),
        )
    }

    /// Enumerate the service's object tree, decoded.
    pub async fn managed_objects(&self, service: &str) -> Result<ObjectMap> {
        let raw = self.proxy(service, "/").get_managed_objects().await?;
        let mut objects = ObjectMap::new();
        for (path, interfaces) in &raw {
            let mut by_interface = HashMap::new();
            for (interface, props) in interfaces {
                by_interface.insert(interface.clone(), decode_prop_map(props));
            }
            objects.insert(path.to_string(), by_interface);
        }
        Ok(objects)
    }

    pub async fn get_string(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<String> {
        Ok(self
            .proxy(service, path)
            .get::<String>(interface, name)
            .await?)
    }

    pub async fn get_object_path(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<String> {
        let value = self
            .proxy(service, path)
            .get::<Box<dyn RefArg>>(interface, name)
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                DaemonError::RemoteCall(dbus::Error::new_custom(
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    "property is not an object path",
                ))
            })
    }

    pub async fn get_u16(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<u16> {
        Ok(self.proxy(service, path).get::<u16>(interface, name).await?)
    }

    pub async fn get_byte(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<u8> {
        Ok(self.proxy(service, path).get::<u8>(interface, name).await?)
    }

    pub async fn set_bool(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: bool,
    ) -> Result<()> {
        Ok(self.proxy(service, path).set(interface, name, value).await?)
    }

    pub async fn set_u16(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: u16,
    ) -> Result<()> {
        Ok(self.proxy(service, path).set(interface, name, value).await?)
    }

    /// No-argument, no-result method call (Play, Pause, Disconnect, ...).
    pub async fn call(&self, service: &str, path: &str, interface: &str, method: &str) -> Result<()> {
        let () = self
            .proxy(service, path)
            .method_call(interface, method, ())
            .await?;
        Ok(())
    }

    /// Subscribe to the BlueZ object tree: property changes plus object
    /// lifecycle. Events are decoded in the receive callback and forwarded
    /// into the router's dispatch channel; a single consumer preserves
    /// bus-delivery order per source path.
    pub async fn subscribe_bluez(&self, tx: mpsc::UnboundedSender<BusEvent>) -> Result<()> {
        let props_rule =
            MatchRule::new_signal("org.freedesktop.DBus.Properties", "PropertiesChanged");
        let added_rule =
            MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesAdded");
        let removed_rule =
            MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesRemoved");

        // The daemon-side registration filters on the BlueZ sender; the
        // local rules stay sender-free because the daemon hands us signals
        // with the emitter's unique name filled in.
        for rule in [&props_rule, &added_rule, &removed_rule] {
            let mut registered = rule.clone();
            registered.sender = Some("org.bluez".into());
            self.conn.add_match_no_cb(&registered.match_str()).await?;
        }

        let props_tx = tx.clone();
        self.conn.start_receive(
            props_rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                if let (Some(path), Ok((interface, changed, _invalidated))) = (
                    msg.path(),
                    msg.read3::<String, PropMap, Vec<String>>(),
                ) {
                    let _ = props_tx.send(BusEvent::PropertiesChanged {
                        seq: next_seq(),
                        path: path.to_string(),
                        interface,
                        changed: decode_prop_map(&changed),
                    });
                }
                true
            }),
        );

        let added_tx = tx.clone();
        self.conn.start_receive(
            added_rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                if let Ok((path, interfaces)) =
                    msg.read2::<dbus::Path, HashMap<String, PropMap>>()
                {
                    let decoded = interfaces
                        .iter()
                        .map(|(name, props)| (name.clone(), decode_prop_map(props)))
                        .collect();
                    let _ = added_tx.send(BusEvent::ObjectAdded {
                        seq: next_seq(),
                        path: path.to_string(),
                        interfaces: decoded,
                    });
                }
                true
            }),
        );

        let removed_tx = tx;
        self.conn.start_receive(
            removed_rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                if let Ok((path, interfaces)) = msg.read2::<dbus::Path, Vec<String>>() {
                    let _ = removed_tx.send(BusEvent::ObjectRemoved {
                        seq: next_seq(),
                        path: path.to_string(),
                        interfaces,
                    });
                }
                true
            }),
        );

        Ok(())
    }

    /// Subscribe to oFono call lifecycle signals on this connection.
    pub async fn subscribe_calls(&self, tx: mpsc::UnboundedSender<BusEvent>) -> Result<()> {
        let added_rule = MatchRule::new_signal("org.ofono.VoiceCallManager", "CallAdded");
        let removed_rule = MatchRule::new_signal("org.ofono.VoiceCallManager", "CallRemoved");
        let prop_rule = MatchRule::new_signal("org.ofono.VoiceCall", "PropertyChanged");

        for rule in [&added_rule, &removed_rule, &prop_rule] {
            self.conn.add_match_no_cb(&rule.match_str()).await?;
        }

        let added_tx = tx.clone();
        self.conn.start_receive(
            added_rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                if let Ok((call, properties)) = msg.read2::<dbus::Path, PropMap>() {
                    let _ = added_tx.send(BusEvent::CallAdded {
                        seq: next_seq(),
                        call: call.to_string(),
                        properties: decode_prop_map(&properties),
                    });
                }
                true
            }),
        );

        let removed_tx = tx.clone();
        self.conn.start_receive(
            removed_rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                if let Ok(call) = msg.read1::<dbus::Path>() {
                    let _ = removed_tx.send(BusEvent::CallRemoved {
                        seq: next_seq(),
                        call: call.to_string(),
                    });
                }
                true
            }),
        );

        let prop_tx = tx;
        self.conn.start_receive(
            prop_rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                if let (Some(call), Ok((name, value))) = (
                    msg.path(),
                    msg.read2::<String, dbus::arg::Variant<Box<dyn RefArg>>>(),
                ) {
                    let _ = prop_tx.send(BusEvent::CallPropertyChanged {
                        seq: next_seq(),
                        call: call.to_string(),
                        name,
                        value: decode_ref_arg(&value.0),
                    });
                }
                true
            }),
        );

        Ok(())
    }

    /// Register a handler for method calls addressed to one of our own
    /// object paths (the pairing agent). The handler runs on the
    /// connection's event loop and must not block.
    pub fn receive_method_calls<F>(&self, object_path: &str, mut handler: F)
    where
        F: FnMut(Message, &Arc<SyncConnection>) + Send + 'static,
    {
        let mut rule = MatchRule::new();
        rule.msg_type = Some(dbus::message::MessageType::MethodCall);
        rule.path = Some(object_path.to_string().into());

        let conn = self.conn.clone();
        self.conn.start_receive(
            rule,
            Box::new(move |msg: Message, _: &SyncConnection| {
                handler(msg, &conn);
                true
            }),
        );
    }
}

pub fn decode_prop_map(props: &PropMap) -> HashMap<String, PropValue> {
    props
        .iter()
        .map(|(name, value)| (name.clone(), decode_ref_arg(&value.0)))
        .collect()
}

/// Convert a borrowed D-Bus argument into an owned `PropValue`.
pub fn decode_ref_arg(value: &dyn RefArg) -> PropValue {
    match value.arg_type() {
        ArgType::Variant => value
            .as_iter()
            .and_then(|mut it| it.next().map(decode_ref_arg))
            .unwrap_or(PropValue::Other),
        ArgType::String | ArgType::ObjectPath | ArgType::Signature => value
            .as_str()
            .map(|s| PropValue::Str(s.to_string()))
            .unwrap_or(PropValue::Other),
        ArgType::Boolean => value
            .as_i64()
            .map(|v| PropValue::Bool(v != 0))
            .unwrap_or(PropValue::Other),
        ArgType::Byte | ArgType::UInt16 | ArgType::UInt32 | ArgType::UInt64 => value
            .as_u64()
            .map(PropValue::Uint)
            .unwrap_or(PropValue::Other),
        ArgType::Int16 | ArgType::Int32 | ArgType::Int64 => value
            .as_i64()
            .map(PropValue::Int)
            .unwrap_or(PropValue::Other),
        ArgType::Double => value
            .as_f64()
            .map(PropValue::Float)
            .unwrap_or(PropValue::Other),
        ArgType::Array => {
            let is_dict = value.signature().starts_with("a{");
            match value.as_iter() {
                Some(mut it) if is_dict => {
                    let mut map = HashMap::new();
                    while let (Some(key), Some(entry)) = (it.next(), it.next()) {
                        if let Some(key) = key.as_str() {
                            map.insert(key.to_string(), decode_ref_arg(entry));
                        }
                    }
                    PropValue::Map(map)
                }
                Some(it) => PropValue::List(it.map(decode_ref_arg).collect()),
                None => PropValue::Other,
            }
        }
        ArgType::Struct => value
            .as_iter()
            .map(|it| PropValue::List(it.map(decode_ref_arg).collect()))
            .unwrap_or(PropValue::Other),
        _ => PropValue::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus::arg::Variant;

    #[test]
    fn decodes_scalar_variants() {
        let s: Box<dyn RefArg> = Box::new("playing".to_string());
        assert_eq!(
            decode_ref_arg(&Variant(s)),
            PropValue::Str("playing".to_string())
        );

        let v: Box<dyn RefArg> = Box::new(64u16);
        assert_eq!(decode_ref_arg(&Variant(v)), PropValue::Uint(64));

        let b: Box<dyn RefArg> = Box::new(true);
        assert_eq!(decode_ref_arg(&Variant(b)), PropValue::Bool(true));
    }

    #[test]
    fn decodes_nested_track_dictionary() {
        let mut track: PropMap = PropMap::new();
        track.insert(
            "Title".to_string(),
            Variant(Box::new("Song A".to_string()) as Box<dyn RefArg>),
        );
        track.insert(
            "Duration".to_string(),
            Variant(Box::new(215000u32) as Box<dyn RefArg>),
        );

        let decoded = decode_ref_arg(&track as &dyn RefArg);
        let map = decoded.as_map().expect("track decodes to a map");
        assert_eq!(map["Title"], PropValue::Str("Song A".to_string()));
        assert_eq!(map["Duration"], PropValue::Uint(215000));
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let a = next_seq();
        let b = next_seq();
        assert!(b > a);
    }
}
