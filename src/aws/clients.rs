//! Per-service client sets, keyed by account id.
//!
//! Construction resolves each configured account's named credentials
//! (a shared-config profile, or a web-identity role assumed with a
//! service-account token), asks STS for the caller identity once, then
//! builds one client per service. Credential refresh re-runs
//! [`configure`], which overwrites the registry entries and renews
//! web-identity sessions; in-flight handlers keep the clone they
//! already obtained for the duration of the current call.
use std::path::PathBuf;

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_sts::operation::assume_role_with_web_identity::AssumeRoleWithWebIdentityError;
use aws_sdk_sts::operation::get_caller_identity::GetCallerIdentityError;
use kube::config::{KubeConfigOptions, Kubeconfig};
use once_cell::sync::Lazy;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{info, warn};

use crate::config::{AwsAccountConfig, AwsConfig, AwsWebIdentityConfig};
use crate::registry::Registry;
use crate::utils::string_value;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get caller identity: {}", source))]
    CallerIdentity {
        source: aws_sdk_sts::error::SdkError<GetCallerIdentityError>,
    },

    #[snafu(display("failed to read kubeconfig: {}", source))]
    ReadKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to build kube client: {}", source))]
    BuildKubeClient { source: kube::Error },

    #[snafu(display("failed to mint service-account token: {}", source))]
    MintToken { source: kube::Error },

    #[snafu(display("token request returned no token"))]
    NoTokenInResponse,

    #[snafu(display("failed to assume role with web identity: {}", source))]
    AssumeWebIdentity {
        source: aws_sdk_sts::error::SdkError<AssumeRoleWithWebIdentityError>,
    },

    #[snafu(display("assume-role response carries no credentials"))]
    NoCredentialsInResponse,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An authenticated service client plus the identity it acts as.
#[derive(Debug, Clone)]
pub struct Client<T> {
    pub account_id: String,
    pub arn: String,
    pub user_id: String,
    pub inner: T,
}

pub type ClientSet<T> = Registry<String, Client<T>>;

pub static EC2: Lazy<ClientSet<aws_sdk_ec2::Client>> = Lazy::new(Registry::new);
pub static S3: Lazy<ClientSet<aws_sdk_s3::Client>> = Lazy::new(Registry::new);
pub static ELB: Lazy<ClientSet<aws_sdk_elasticloadbalancing::Client>> = Lazy::new(Registry::new);
pub static ELBV2: Lazy<ClientSet<aws_sdk_elasticloadbalancingv2::Client>> =
    Lazy::new(Registry::new);
pub static ROUTE53: Lazy<ClientSet<aws_sdk_route53::Client>> = Lazy::new(Registry::new);

/// Builds clients for every configured account. An account that fails to
/// authenticate is logged and skipped; the rest still register. Returns
/// the number of accounts that made it in.
pub async fn configure(cfg: &AwsConfig) -> usize {
    let mut configured = 0;
    for account in &cfg.accounts {
        match configure_account(cfg, account).await {
            Ok(account_id) => {
                info!(account = %account.name, account_id = %account_id, "registered AWS clients");
                configured += 1;
            }
            Err(err) => {
                warn!(account = %account.name, "failed to register AWS clients: {}", err);
            }
        }
    }
    configured
}

/// Web-identity JWT for assuming an IAM role: minted through the
/// cluster's TokenRequest API for the given service account.
pub async fn web_identity_token(
    client: kube::Client,
    namespace: &str,
    service_account: &str,
    audiences: Vec<String>,
    duration_secs: i64,
) -> Result<String> {
    use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
    use k8s_openapi::api::core::v1::ServiceAccount;

    let api: kube::Api<ServiceAccount> = kube::Api::namespaced(client, namespace);
    let request = TokenRequest {
        spec: TokenRequestSpec {
            audiences,
            expiration_seconds: Some(duration_secs),
            ..Default::default()
        },
        ..Default::default()
    };
    let response = api
        .create_token_request(service_account, &kube::api::PostParams::default(), &request)
        .await
        .context(MintToken)?;
    response
        .status
        .map(|status| status.token)
        .filter(|token| !token.is_empty())
        .context(NoTokenInResponse)
}

async fn minting_kube_client(kubeconfig: Option<&PathBuf>) -> Result<kube::Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfig)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context(ReadKubeconfig)?;
            kube::Client::try_from(config).context(BuildKubeClient)
        }
        None => kube::Client::try_default().await.context(BuildKubeClient),
    }
}

/// Session credentials for an account that authenticates through web
/// identity: a token minted for the configured service account is
/// exchanged with `AssumeRoleWithWebIdentity`. The scheduled client
/// refresh re-runs this before the session expires.
async fn web_identity_credentials(
    cfg: &AwsConfig,
    web_identity: &AwsWebIdentityConfig,
) -> Result<Credentials> {
    let minter = minting_kube_client(web_identity.kubeconfig.as_ref()).await?;
    let jwt = web_identity_token(
        minter,
        &web_identity.namespace,
        &web_identity.service_account,
        web_identity.audiences.clone(),
        web_identity.duration_secs,
    )
    .await?;

    // AssumeRoleWithWebIdentity is an unsigned call.
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).no_credentials();
    if let Some(region) = &cfg.default_region {
        loader = loader.region(Region::new(region.clone()));
    }
    let sts = aws_sdk_sts::Client::new(&loader.load().await);
    let assumed = sts
        .assume_role_with_web_identity()
        .role_arn(&web_identity.role_arn)
        .role_session_name(&web_identity.session_name)
        .web_identity_token(jwt)
        .send()
        .await
        .context(AssumeWebIdentity)?;
    let session = assumed.credentials().context(NoCredentialsInResponse)?;
    Ok(Credentials::new(
        session.access_key_id(),
        session.secret_access_key(),
        Some(session.session_token().to_owned()),
        std::time::SystemTime::try_from(*session.expiration()).ok(),
        "web-identity",
    ))
}

struct Identity {
    account_id: String,
    arn: String,
    user_id: String,
}

impl Identity {
    fn client<T>(&self, inner: T) -> Client<T> {
        Client {
            account_id: self.account_id.clone(),
            arn: self.arn.clone(),
            user_id: self.user_id.clone(),
            inner,
        }
    }
}

async fn configure_account(cfg: &AwsConfig, account: &AwsAccountConfig) -> Result<String> {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &cfg.default_region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(web_identity) = &account.web_identity {
        let credentials = web_identity_credentials(cfg, web_identity).await?;
        loader = loader.credentials_provider(credentials);
    } else if let Some(profile) = &account.profile {
        loader = loader.profile_name(profile);
    }
    let sdk_config = loader.load().await;

    let caller = aws_sdk_sts::Client::new(&sdk_config)
        .get_caller_identity()
        .send()
        .await
        .context(CallerIdentity)?;
    let identity = Identity {
        account_id: string_value(caller.account()),
        arn: string_value(caller.arn()),
        user_id: string_value(caller.user_id()),
    };
    let account_id = identity.account_id.clone();

    EC2.overwrite(
        account_id.clone(),
        identity.client(aws_sdk_ec2::Client::new(&sdk_config)),
    );
    S3.overwrite(
        account_id.clone(),
        identity.client(aws_sdk_s3::Client::new(&sdk_config)),
    );
    ELB.overwrite(
        account_id.clone(),
        identity.client(aws_sdk_elasticloadbalancing::Client::new(&sdk_config)),
    );
    ELBV2.overwrite(
        account_id.clone(),
        identity.client(aws_sdk_elasticloadbalancingv2::Client::new(&sdk_config)),
    );
    ROUTE53.overwrite(
        account_id.clone(),
        identity.client(aws_sdk_route53::Client::new(&sdk_config)),
    );
    Ok(account_id)
}
