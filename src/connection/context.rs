use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// String-keyed bag of per-connection values.
///
/// Framing protocols use this for connection-scoped state that survives
/// between frames, such as a handshake-completed marker. Only the owning
/// loop touches it, so there is no lock.
#[derive(Default)]
pub struct KvContext {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl KvContext {
    pub fn set(&mut self, key: impl Into<String>, value: Box<dyn Any + Send>) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&(dyn Any + Send)> {
        self.values.get(key).map(|v| v.as_ref())
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send>> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl fmt::Debug for KvContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_downcast() {
        let mut kv = KvContext::default();
        kv.set("upgraded", Box::new(true));
        let value = kv.get("upgraded").unwrap().downcast_ref::<bool>();
        assert_eq!(value, Some(&true));
        assert!(!kv.contains("missing"));
    }

    #[test]
    fn remove_takes_value() {
        let mut kv = KvContext::default();
        kv.set("counter", Box::new(7u32));
        let value = kv.remove("counter").unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 7);
        assert!(!kv.contains("counter"));
    }
}
