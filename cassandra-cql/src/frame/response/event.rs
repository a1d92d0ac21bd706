use crate::frame::frame_errors::ParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use bytes::BufMut;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    MovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl SchemaChangeType {
    fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
            SchemaChangeType::Invalid => "INVALID",
        }
    }
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange(_) => EventType::TopologyChange,
            Event::StatusChange(_) => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }

    /// Writes the body of an EVENT response. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_string(&self.event_type().to_string(), buf)?;
        match self {
            Event::TopologyChange(change) => {
                let (name, addr) = match change {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                    TopologyChangeEvent::MovedNode(addr) => ("MOVED_NODE", addr),
                };
                types::write_string(name, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(change) => {
                let (name, addr) = match change {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(name, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(SchemaChangeEvent::KeyspaceChange {
                change_type,
                keyspace_name,
            }) => {
                types::write_string(change_type.as_str(), buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string("", buf)?;
            }
            Event::SchemaChange(SchemaChangeEvent::TableChange {
                change_type,
                keyspace_name,
                object_name,
            }) => {
                types::write_string(change_type.as_str(), buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(object_name, buf)?;
            }
        }
        Ok(())
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = match types::read_string(buf)? {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let keyspace_affected = types::read_string(buf)?.to_string();
        // An empty table name means the change concerns the keyspace itself.
        let table_affected = types::read_string(buf)?;

        if table_affected.is_empty() {
            Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            })
        } else {
            Ok(Self::TableChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                object_name: table_affected.to_string(),
            })
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of change ({}) in TopologyChangeEvent",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of status change ({}) in StatusChangeEvent",
                type_of_change
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_change_with_empty_table_is_keyspace_change() {
        let mut buf = Vec::new();
        types::write_string("SCHEMA_CHANGE", &mut buf).unwrap();
        types::write_string("DROPPED", &mut buf).unwrap();
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("", &mut buf).unwrap();

        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            event,
            Event::SchemaChange(SchemaChangeEvent::KeyspaceChange {
                change_type: SchemaChangeType::Dropped,
                keyspace_name: "ks".to_string(),
            })
        );
    }

    #[test]
    fn moved_node_is_parsed() {
        let addr: SocketAddr = "10.1.2.3:9042".parse().unwrap();
        let mut buf = Vec::new();
        types::write_string("TOPOLOGY_CHANGE", &mut buf).unwrap();
        types::write_string("MOVED_NODE", &mut buf).unwrap();
        types::write_inet(addr, &mut buf);

        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            event,
            Event::TopologyChange(TopologyChangeEvent::MovedNode(addr))
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut buf = Vec::new();
        types::write_string("STATUS_CHANGE", &mut buf).unwrap();
        types::write_string("SIDEWAYS", &mut buf).unwrap();
        types::write_inet("127.0.0.1:9042".parse().unwrap(), &mut buf);
        assert!(Event::deserialize(&mut &buf[..]).is_err());
    }
}
