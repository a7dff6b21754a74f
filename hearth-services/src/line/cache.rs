use std::sync::Arc;

use bytes::Bytes;
use hearth_core::storage::Storage;

use super::{RequestError, RequestHandler};

/// Text command interface over the runtime's tagged storage.
///
/// Commands: `SET key value [tag ...]`, `GET key`, `DEL key`,
/// `TAGDEL tag`, `KEYS`. Workers share one storage handle, so entries
/// written through one connection are visible to every other.
#[derive(Clone)]
pub struct CacheHandler {
    storage: Arc<dyn Storage>,
}

impl CacheHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl RequestHandler for CacheHandler {
    fn handle(&self, request: &str) -> Result<String, RequestError> {
        let mut tokens = request.split_whitespace();
        let verb = tokens
            .next()
            .ok_or(RequestError::Malformed("empty request"))?;
        match verb.to_ascii_uppercase().as_str() {
            "SET" => {
                let key = tokens.next().ok_or(RequestError::Malformed("SET needs a key"))?;
                let value = tokens
                    .next()
                    .ok_or(RequestError::Malformed("SET needs a value"))?;
                let tags: Vec<String> = tokens.map(|t| t.to_string()).collect();
                self.storage
                    .set(key, Bytes::copy_from_slice(value.as_bytes()), &tags, None);
                Ok("OK".to_string())
            }
            "GET" => {
                let key = tokens.next().ok_or(RequestError::Malformed("GET needs a key"))?;
                Ok(match self.storage.get(key) {
                    Some(data) => String::from_utf8_lossy(&data).into_owned(),
                    None => "NIL".to_string(),
                })
            }
            "DEL" => {
                let key = tokens.next().ok_or(RequestError::Malformed("DEL needs a key"))?;
                Ok(if self.storage.remove(key) { "1" } else { "0" }.to_string())
            }
            "TAGDEL" => {
                let tag = tokens
                    .next()
                    .ok_or(RequestError::Malformed("TAGDEL needs a tag"))?;
                Ok(self.storage.flush_by_tag(tag).to_string())
            }
            "KEYS" => Ok(self.storage.keys().join(" ")),
            _ => Err(RequestError::UnknownCommand(verb.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hearth_core::storage::MemoryStore;

    use super::{CacheHandler, RequestHandler};

    fn handler() -> CacheHandler {
        CacheHandler::new(Arc::new(MemoryStore::default()))
    }

    #[test]
    fn set_get_del_round_trip() {
        let handler = handler();
        assert_eq!(handler.handle("SET greeting hello").unwrap(), "OK");
        assert_eq!(handler.handle("GET greeting").unwrap(), "hello");
        assert_eq!(handler.handle("DEL greeting").unwrap(), "1");
        assert_eq!(handler.handle("GET greeting").unwrap(), "NIL");
        assert_eq!(handler.handle("DEL greeting").unwrap(), "0");
    }

    #[test]
    fn tagged_entries_flush_together() {
        let handler = handler();
        handler.handle("SET a 1 session").unwrap();
        handler.handle("SET b 2 session").unwrap();
        handler.handle("SET c 3 other").unwrap();
        assert_eq!(handler.handle("TAGDEL session").unwrap(), "2");
        assert_eq!(handler.handle("KEYS").unwrap(), "c");
    }

    #[test]
    fn verbs_are_case_insensitive_and_checked() {
        let handler = handler();
        assert_eq!(handler.handle("set k v").unwrap(), "OK");
        assert_eq!(handler.handle("get k").unwrap(), "v");
        assert!(handler.handle("SET only-a-key").is_err());
        assert!(handler.handle("NOPE x").is_err());
        assert!(handler.handle("").is_err());
    }
}
