//! Per-bucket name ledger.
//!
//! Names are the one mutable piece of identity: creation conflicts and
//! concurrent renames are detected against the names the session
//! believes are claimed, not against whatever the live store currently
//! shows.

use std::collections::HashMap;

use crate::ident::DatablockId;

#[derive(Debug, Default)]
pub struct CollectionProxy {
    names: HashMap<String, DatablockId>,
}

impl CollectionProxy {
    pub fn claim(&mut self, name: &str, id: DatablockId) {
        self.names.insert(name.to_string(), id);
    }

    pub fn release(&mut self, name: &str) {
        self.names.remove(name);
    }

    /// Who currently claims `name`, if any synchronized datablock does.
    pub fn holder(&self, name: &str) -> Option<DatablockId> {
        self.names.get(name).copied()
    }

    pub fn rename(&mut self, old: &str, new: &str, id: DatablockId) {
        if self.names.get(old) == Some(&id) {
            self.names.remove(old);
        }
        self.names.insert(new.to_string(), id);
    }
}
