//! When a read destroys the record it returns.
//!
//! Every record is `Live` until it is either consumed by a read or passes
//! `expires_at`. Both terminal states look the same to callers: not found.

use crate::store::{Kind, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisclosurePolicy {
    /// Also burn encrypted pastes on first read, even without `one_time`.
    /// Off by default: `encrypted` and `one_time` are independent flags.
    pub encrypted_paste_burns: bool,
}

impl DisclosurePolicy {
    pub fn consumes(&self, record: &Record) -> bool {
        match record.kind() {
            Kind::Secret => true,
            _ if record.one_time => true,
            Kind::Paste => record.encrypted && self.encrypted_paste_burns,
            Kind::Link | Kind::Image => false,
        }
    }
}
