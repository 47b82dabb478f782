#![deny(clippy::all)]

use kratos_ldap_lib::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::start_ldap_server().await
}
