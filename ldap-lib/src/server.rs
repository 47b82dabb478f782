use std::{
    fmt::{Display, Formatter},
    net,
    str::FromStr,
    sync::Arc,
    time,
};

use anyhow::Context;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use ldap3_proto::{LdapCodec, LdapResultCode};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::{config, kratos, proto};

#[derive(Debug)]
pub struct LdapClientSession {
    pub id: Uuid,
    pub bind_info: Option<proto::LdapBindInfo>,
}

impl LdapClientSession {
    pub fn new() -> Self {
        LdapClientSession {
            id: Uuid::new_v4(),
            bind_info: None,
        }
    }
}

impl Default for LdapClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LdapClientSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bind_info = if let Some(bind_info) = &self.bind_info {
            format!("bound to '{}'", bind_info.client)
        } else {
            "unbound".to_string()
        };
        write!(f, "{} ({})", self.id, bind_info)
    }
}

/// Run the LDAP gateway until the process is interrupted.
///
/// This method is meant to be the ONLY method called from the main function
/// of the binary. It will handle argument parsing and setup logging, which the binary
/// is expected to NOT do itself.
pub async fn start_ldap_server() -> anyhow::Result<()> {
    let args = config::CliArguments::parse();

    let level = args.log_level.log_level_filter().as_str().to_lowercase();
    tracing_subscriber::fmt()
        // Use configured log level for our library, and WARN for everything else.
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::Directive::from_str(&format!("kratos_ldap_lib={level}"))?)
                .from_env()?
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = config::GatewayConfig::try_from(&args)?;
    let kratos = Arc::new(kratos::ProviderClient::new(&config.provider).context("Could not set up Kratos client")?);
    let handler = Arc::new(proto::LdapHandler::new(
        kratos,
        config.identities_dn.clone(),
        proto::HandlerPolicy {
            protected_search: config.protected_search,
            allow_session_token_as_password: config.allow_session_token_as_password,
        },
    ));

    LdapServer::start(&config, handler).await?.serve().await
}

/// A bound listener handing every accepted connection to its own client session.
pub struct LdapServer {
    listener: tokio::net::TcpListener,
    handler: Arc<proto::LdapHandler>,
    session_first_answer_delay: time::Duration,
}

impl LdapServer {
    /// Bind the listening socket. Connections are only accepted once [LdapServer::serve] runs.
    pub async fn start(config: &config::GatewayConfig, handler: Arc<proto::LdapHandler>) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind_address)
            .await
            .with_context(|| format!("Could not bind to LDAP server address {}", config.bind_address))?;
        Ok(Self {
            listener,
            handler,
            session_first_answer_delay: config.session_first_answer_delay,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until ctrl-c is received. Sessions still running at that point are
    /// dropped along with the runtime.
    pub async fn serve(self) -> anyhow::Result<()> {
        tracing::info!("LDAP server listening on ldap://{}", self.local_addr()?);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = &mut shutdown => {
                    result.context("Could not listen for shutdown signal")?;
                    tracing::info!("Received shutdown signal, stopping LDAP server");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp_stream, client_socket_addr)) => {
                        tokio::spawn(client_session(
                            self.handler.clone(),
                            tcp_stream,
                            client_socket_addr,
                            self.session_first_answer_delay,
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "TCP listener accept error, continuing");
                    }
                }
            }
        }
    }
}

/// Initiate an LDAP session. Will capture any errors that occur while handling the session and
/// convert them into log messages.
async fn client_session(
    ldap: Arc<proto::LdapHandler>,
    tcp_stream: tokio::net::TcpStream,
    client_address: net::SocketAddr,
    delay_before_first_answer: time::Duration,
) {
    let mut session = LdapClientSession::new();
    tracing::info!(%session, client = %client_address, "Starting new client session");
    if let Err(e) = _client_session(&mut session, ldap, tcp_stream, client_address, delay_before_first_answer).await {
        tracing::error!(%session, error = ?e, "An error occurred while handling client session");
    }
    tracing::info!(%session, "Closing client session");
}

/// Handle receiving and sending of LDAP messages for a client session.
async fn _client_session<T>(
    session: &mut LdapClientSession,
    ldap: Arc<proto::LdapHandler>,
    stream: T,
    client_address: net::SocketAddr,
    delay_before_first_answer: time::Duration,
) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    let mut ldap_reader = tokio_util::codec::FramedRead::new(r, LdapCodec::default());
    let mut ldap_writer = tokio_util::codec::FramedWrite::new(w, LdapCodec::default());

    // Some clients (namely Apache Directory Studio) miss our first response if it arrives too fast
    // and then time out. After the first exchange, their listener is set up and no delay is needed.
    if !delay_before_first_answer.is_zero() {
        tokio::time::sleep(delay_before_first_answer).await;
    }

    while let Some(protomsg) = ldap_reader.next().await {
        let protomsg = protomsg.context("Could not decode LDAP message")?;
        tracing::trace!(
            %session,
            client_ip = %client_address.ip(),
            client_port = client_address.port(),
            msg = ?protomsg,
            "Received protocol message"
        );
        let msg_id = protomsg.msgid;
        let operation_result = match ldap3_proto::ServerOps::try_from(protomsg) {
            Ok(server_op) => {
                tracing::debug!(msg_id, %session, operation = ?server_op, "Performing LDAP operation");
                ldap.perform_ldap_operation(server_op, session).await
            }
            Err(_) => proto::LdapResponseState::Disconnect(ldap3_proto::DisconnectionNotice::r#gen(
                LdapResultCode::ProtocolError,
                format!("Invalid Request in session {}: msg {}", session.id, msg_id).as_str(),
            )),
        };

        match operation_result {
            proto::LdapResponseState::Bind(new_bind, return_message) => {
                session.bind_info = new_bind;
                tracing::trace!(%session, ?return_message, "Sending protocol answer");
                ldap_writer.send(return_message).await?;
            }
            proto::LdapResponseState::Unbind => break,
            proto::LdapResponseState::Respond(return_message) => {
                tracing::trace!(%session, ?return_message, "Sending protocol answer");
                ldap_writer.send(return_message).await?;
            }
            proto::LdapResponseState::MultiPartRespond(messages) => {
                for return_message in messages.into_iter() {
                    tracing::trace!(%session, ?return_message, "Sending protocol answer");
                    ldap_writer.send(return_message).await?;
                }
            }
            proto::LdapResponseState::Disconnect(return_message) => {
                ldap_writer.send(return_message).await?;
                break;
            }
        };
    }

    Ok(())
}
