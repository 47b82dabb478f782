use crate::{
    dn,
    dto::{entry, identity},
};

/// The attribute naming an identity inside the identities subtree.
pub const IDENTIFIER_ATTRIBUTE: &str = "identifier";

/// Builds the directory entries we serve below the configured identities DN.
#[derive(Debug, Clone)]
pub struct LdapEntryBuilder {
    identities_distinguished_name: String,
}

impl LdapEntryBuilder {
    pub fn new(identities_distinguished_name: String) -> Self {
        Self {
            identities_distinguished_name,
        }
    }

    /// The DN of an identity in our LDAP tree.
    pub fn identity_dn(&self, identifier: &str) -> String {
        format!(
            "{IDENTIFIER_ATTRIBUTE}={},{}",
            dn::escape_value(identifier),
            self.identities_distinguished_name
        )
    }

    /// Convert a Kratos identity to its corresponding LDAP representation.
    /// Identities without a resolvable identifier have no place in our tree and yield `None`.
    ///
    /// Traits are merged in after the reserved attributes, so a trait named like one of them
    /// (`id`, `schema_id`, `objectClass`, `identifier`) replaces the reserved value.
    pub fn build_from_identity(&self, identity: &identity::Identity, schema: &identity::Schema) -> Option<entry::LdapEntry> {
        let Some(identifier) = identity::identifier_of(identity, schema) else {
            tracing::debug!(identity = identity.id, schema = schema.id, "Identity has no identifier, skipping");
            return None;
        };

        let mut entry = entry::LdapEntry::new(self.identity_dn(&identifier));
        // The LDAP specification says that we need to have an attribute matching the identifier used in the dn.
        entry.set_attribute(IDENTIFIER_ATTRIBUTE, vec![identifier]);
        entry.set_attribute("id", vec![identity.id.clone()]);
        entry.set_attribute("schema_id", vec![identity.schema_id.clone()]);
        entry.set_attribute("objectClass", vec![identity.schema_id.clone()]);
        for (key, value) in identity.trait_values() {
            let values = value.attribute_values();
            if !values.is_empty() {
                entry.set_attribute(key, values);
            }
        }

        Some(entry)
    }
}
