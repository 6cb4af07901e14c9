use crate::frame::frame_errors::{
    ClusterChangeEventParseError, CqlEventParseError, SchemaChangeEventParseError,
};
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use bytes::BufMut;
use std::net::SocketAddr;

/// Event that the server pushed on the event stream.
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
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// What changed in the schema, and where.
///
/// Functions and aggregates carry their argument types because they
/// may be overloaded.
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
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::TopologyChange(
                TopologyChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::TopologyChangeEventParseError)?,
            )),
            EventType::StatusChange => Ok(Self::StatusChange(
                StatusChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::StatusChangeEventParseError)?,
            )),
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

    /// Writes the EVENT body for node-level events. Used by test servers.
    pub fn serialize_cluster_change(
        &self,
        buf: &mut impl BufMut,
    ) -> Result<(), std::num::TryFromIntError> {
        let (change, addr) = match self {
            Event::TopologyChange(TopologyChangeEvent::NewNode(addr)) => ("NEW_NODE", addr),
            Event::TopologyChange(TopologyChangeEvent::RemovedNode(addr)) => {
                ("REMOVED_NODE", addr)
            }
            Event::StatusChange(StatusChangeEvent::Up(addr)) => ("UP", addr),
            Event::StatusChange(StatusChangeEvent::Down(addr)) => ("DOWN", addr),
            Event::SchemaChange(_) => return Ok(()),
        };
        types::write_string(&self.event_type().to_string(), buf)?;
        types::write_string(change, buf)?;
        types::write_inet(*addr, buf);
        Ok(())
    }
}

fn read_argument_types(buf: &mut &[u8]) -> Result<Vec<String>, SchemaChangeEventParseError> {
    let number_of_arguments =
        types::read_short(buf).map_err(SchemaChangeEventParseError::ArgumentCountParseError)?;

    let mut arguments = Vec::with_capacity(number_of_arguments as usize);
    for _ in 0..number_of_arguments {
        arguments.push(
            types::read_string(buf)
                .map_err(SchemaChangeEventParseError::FunctionArgumentParseError)?
                .to_string(),
        );
    }
    Ok(arguments)
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, SchemaChangeEventParseError> {
        let type_of_change_string =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TypeOfChangeParseError)?;
        let change_type = match type_of_change_string {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TargetTypeParseError)?;
        let keyspace_name = types::read_string(buf)
            .map_err(SchemaChangeEventParseError::AffectedKeyspaceParseError)?
            .to_string();

        if target == "KEYSPACE" {
            return Ok(Self::KeyspaceChange {
                change_type,
                keyspace_name,
            });
        }

        let name = types::read_string(buf)
            .map_err(SchemaChangeEventParseError::AffectedTargetNameParseError)?
            .to_string();

        match target {
            "TABLE" => Ok(Self::TableChange {
                change_type,
                keyspace_name,
                object_name: name,
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type,
                keyspace_name,
                type_name: name,
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type,
                keyspace_name,
                function_name: name,
                arguments: read_argument_types(buf)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type,
                keyspace_name,
                aggregate_name: name,
                arguments: read_argument_types(buf)?,
            }),
            _ => Err(SchemaChangeEventParseError::UnknownTargetOfSchemaChange(
                target.to_string(),
            )),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}
