use std::{str::FromStr, sync::Arc};

use ldap3_proto::{LdapMsg, LdapResultCode, SearchRequest, ServerOps};
use uuid::Uuid;

use crate::{dn, dto, kratos, server};

#[derive(Debug)]
pub struct LdapError(pub LdapResultCode, pub String);

impl From<kratos::ProviderError> for LdapError {
    /// Whatever went wrong in Kratos, the LDAP operation as a whole failed.
    fn from(e: kratos::ProviderError) -> Self {
        LdapError(LdapResultCode::OperationsError, e.to_string())
    }
}

#[derive(Debug)]
pub struct LdapBindInfo {
    pub client: String,
}

pub enum LdapResponseState {
    /// The session is now bound to the contained identity, or anonymous if there is none.
    Bind(Option<LdapBindInfo>, LdapMsg),
    Unbind,
    Respond(LdapMsg),
    MultiPartRespond(Vec<LdapMsg>),
    Disconnect(LdapMsg),
}

/// Policies deciding what the handler allows clients to do.
#[derive(Debug, Clone, Default)]
pub struct HandlerPolicy {
    /// Search requests are only answered for sessions bound to an identity.
    pub protected_search: bool,
    /// A Kratos session token may be used instead of a password, in which case the identifier may be omitted.
    pub allow_session_token_as_password: bool,
}

/// A handler capable of adhering to the LDAP protocol and properly perform LDAP operations.
/// It knows how our DIT (directory information tree) looks like and how to bind clients by
/// handing off the authentication decision to Kratos.
pub struct LdapHandler {
    kratos: Arc<kratos::ProviderClient>,
    identities_dn: dn::Dn,
    ldap_entry_builder: dto::LdapEntryBuilder,
    policy: HandlerPolicy,
}

impl LdapHandler {
    pub fn new(kratos: Arc<kratos::ProviderClient>, identities_dn: dn::Dn, policy: HandlerPolicy) -> Self {
        LdapHandler {
            kratos,
            ldap_entry_builder: dto::LdapEntryBuilder::new(identities_dn.to_string()),
            identities_dn,
            policy,
        }
    }

    /// Perform an LDAP operation, producing proper LDAP responses.
    /// Errors occurring during the execution will be converted to LDAP error states.
    pub async fn perform_ldap_operation(&self, operation: ServerOps, session: &server::LdapClientSession) -> LdapResponseState {
        match operation {
            ServerOps::SimpleBind(sbr) => match self.do_bind(&session.id, &sbr.dn, &sbr.pw).await {
                Ok(bind_info) => LdapResponseState::Bind(bind_info, sbr.gen_success()),
                Err(e) => {
                    tracing::error!(%session, msg = sbr.msgid, error = ?e, "Error performing bind request");
                    // A failed bind leaves the session anonymous (RFC 4511, section 4.2.1).
                    LdapResponseState::Bind(None, sbr.gen_error(e.0, e.1))
                }
            },
            ServerOps::Search(sr) => self
                .do_search(&session.id, &sr, session.bind_info.as_ref())
                .await
                .map(LdapResponseState::MultiPartRespond)
                .unwrap_or_else(|e| {
                    tracing::error!(%session, msg = sr.msgid, error = ?e, "Error performing search request");
                    LdapResponseState::MultiPartRespond(vec![sr.gen_error(e.0, e.1)])
                }),
            ServerOps::Unbind(_) => LdapResponseState::Unbind,
            ServerOps::Compare(cr) => LdapResponseState::Respond(cr.gen_error(LdapResultCode::UnwillingToPerform, "Operation not supported".to_string())),
            ServerOps::Whoami(wr) => match &session.bind_info {
                Some(u) => LdapResponseState::Respond(wr.gen_success(format!("u: {}", u.client).as_str())),
                None => LdapResponseState::Respond(wr.gen_operror(format!("Unbound Connection {}", session.id).as_str())),
            },
        }
    }

    /// Perform an LDAP bind. The identifier taken from the DN and the password are used to log into
    /// Kratos; whether the bind succeeds depends on whether that login succeeds. If configured, the
    /// password may instead be a Kratos session token.
    ///
    /// An empty DN with an empty password is an anonymous bind, which always succeeds and leaves the
    /// session unauthenticated.
    async fn do_bind(&self, session_id: &Uuid, dn: &str, pw: &str) -> Result<Option<LdapBindInfo>, LdapError> {
        if dn.is_empty() && pw.is_empty() {
            tracing::info!(session = %session_id, "Anonymous LDAP bind");
            return Ok(None);
        }

        let identifier = self.identifier_from_bind_dn(dn)?;
        if !self.policy.allow_session_token_as_password && identifier.is_empty() {
            let rdn = dn::Dn::from_str(dn).ok().and_then(|dn| dn.first_rdn().map(ToString::to_string)).unwrap_or_default();
            return Err(LdapError(
                LdapResultCode::InvalidCredentials,
                format!(r#"RDN must include a non-empty identifier attribute ("identifier=VALUE"). The provided RDN was "{rdn}""#),
            ));
        }
        if pw.is_empty() {
            let message = if self.policy.allow_session_token_as_password {
                "password or session token required"
            } else {
                "password required"
            };
            return Err(LdapError(LdapResultCode::InvalidCredentials, message.to_string()));
        }

        let mut result = self.kratos.login(&identifier, pw).await;
        if let Err(e) = &result {
            if self.policy.allow_session_token_as_password {
                tracing::debug!(session = %session_id, error = %e, "Login failed, trying password as session token");
                result = self.kratos.verify_session_token(pw).await;
            }
        }

        match result {
            Ok(()) => {
                tracing::info!(session = %session_id, client = dn, "LDAP Bind success");
                Ok(Some(LdapBindInfo { client: dn.to_string() }))
            }
            Err(e) => {
                tracing::warn!(session = %session_id, client = dn, error = %e, "LDAP Bind failure, could not authenticate against Kratos");
                Err(e.into())
            }
        }
    }

    /// Extract the identifier from a bind DN. The DN must be the identities DN itself (only allowed
    /// with session tokens, yielding an empty identifier) or a direct child of it.
    fn identifier_from_bind_dn(&self, dn: &str) -> Result<String, LdapError> {
        let parsed = dn::Dn::from_str(dn).map_err(|e| LdapError(LdapResultCode::InvalidCredentials, e.to_string()))?;
        match parsed.depth_below(&self.identities_dn) {
            Some(0) => Ok(String::new()),
            Some(1) => Ok(parsed
                .first_rdn()
                .and_then(|rdn| rdn.get(dto::IDENTIFIER_ATTRIBUTE))
                .unwrap_or_default()
                .to_string()),
            _ => Err(LdapError(
                LdapResultCode::InvalidCredentials,
                format!("DN must be of the form identifier=VALUE,{}", self.identities_dn),
            )),
        }
    }

    /// Perform an LDAP search over all identities known to Kratos. Schemas and identities are fetched
    /// fresh for every search; both requests must succeed, otherwise no entry is returned.
    async fn do_search(&self, session_id: &Uuid, sr: &SearchRequest, bound_user: Option<&LdapBindInfo>) -> Result<Vec<LdapMsg>, LdapError> {
        if self.policy.protected_search && bound_user.is_none() {
            return Err(LdapError(
                LdapResultCode::InsufficentAccessRights,
                "Must authenticate before searching".to_string(),
            ));
        }

        let search_base = dn::Dn::from_str(&sr.base)
            .ok()
            .filter(|base| base.is_within(&self.identities_dn))
            .ok_or_else(|| {
                LdapError(
                    LdapResultCode::NoSuchObject,
                    format!("LDAP Search failure - search base must be within {}", self.identities_dn),
                )
            })?;

        let (schemas, identities) = tokio::try_join!(self.kratos.fetch_schemas(), self.kratos.fetch_identities())?;
        tracing::debug!(
            session = %session_id,
            schemas = schemas.len(),
            identities = identities.len(),
            "Search: Fetched directory from Kratos"
        );

        let mut result_messages = Vec::new();
        for identity in identities.iter() {
            let Some(schema) = schemas.get(&identity.schema_id) else {
                tracing::debug!(identity = identity.id, schema = identity.schema_id, "Identity has unknown schema, skipping");
                continue;
            };
            let Some(entry) = self.ldap_entry_builder.build_from_identity(identity, schema) else {
                continue;
            };
            let within_base = dn::Dn::from_str(&entry.dn).is_ok_and(|entry_dn| entry_dn.is_within(&search_base));
            if within_base && entry.matches_filter(&sr.filter)? {
                result_messages.push(sr.gen_result_entry(entry.new_search_result(&sr.attrs)));
            }
        }

        tracing::debug!(session = %session_id, "Search: Found {} ldap entries", result_messages.len());
        result_messages.push(sr.gen_success());
        Ok(result_messages)
    }
}
