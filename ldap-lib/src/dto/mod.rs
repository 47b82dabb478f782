mod builder;
mod entry;
pub(crate) mod identity;

pub use builder::{IDENTIFIER_ATTRIBUTE, LdapEntryBuilder};
pub use entry::LdapEntry;
pub use identity::{Identity, Schema, TraitValue};
