use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::types;
use std::collections::HashMap;

/// Options the server accepts in STARTUP, with their allowed values.
#[derive(Debug, Clone)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(CqlResponseParseError::CqlSupportedParseError)?;

        Ok(Supported { options })
    }
}
