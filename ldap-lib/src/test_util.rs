#[cfg(test)]
pub mod test_constants {
    pub const IDENTITIES_DN: &str = "ou=identities,dc=example,dc=org";
    pub const SCHEMA_ID: &str = "default";
    pub const ALICE: &str = "alice@example.org";
    pub const BOB: &str = "bob@example.org";
    pub const PASSWORD: &str = "correct horse battery staple";
    pub const SESSION_TOKEN: &str = "ory_st_3b2fa1c2";
}
