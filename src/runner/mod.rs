//! One decorator run, from the bootstrap read to the final revoke.
//!
//! ```text
//! bootstrap secret -> manifest -> references
//!     -> join(renewal loop, inject + launch + wait -> revoke -> stop)
//! ```

use crate::backends::{redact_secret, BackendError, ConfigBackend, PayloadError, SecretBackend};
use crate::config::{InjectionDefinition, ManifestError, Settings, CONSUL_TOKEN_FIELD};
use crate::inject::{InjectError, Injector, ResolvedRefs};
use crate::lease::RenewalSupervisor;
use crate::process::{ChildExit, ProcessCoordinator, ProcessError, SignalListener};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not read bootstrap secret at {path}: {source}")]
    Bootstrap {
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("no bootstrap secret found at {path}")]
    BootstrapMissing { path: String },

    #[error("bootstrap secret at {path} is unusable: {source}")]
    BootstrapField {
        path: String,
        #[source]
        source: PayloadError,
    },

    #[error("could not create config backend client: {0}")]
    Connect(#[source] BackendError),

    #[error("could not fetch manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("could not fetch pod's config: nothing stored at {path}")]
    ManifestMissing { path: String },

    #[error("manifest at {path} is unusable: {source}")]
    ManifestMalformed {
        path: String,
        #[source]
        source: ManifestError,
    },

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("double shutdown triggered, wrapped process was killed")]
    DoubleShutdown,
}

/// Drives a single run against a secret backend and a config backend that
/// is only reachable once the bootstrap secret has been read.
pub struct Orchestrator {
    settings: Settings,
    secrets: Arc<dyn SecretBackend>,
    coordinator: ProcessCoordinator,
    listener: Option<SignalListener>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        secrets: Arc<dyn SecretBackend>,
        command: Vec<String>,
    ) -> Result<Self, RunError> {
        Ok(Self {
            settings,
            secrets,
            coordinator: ProcessCoordinator::new(command)?,
            listener: None,
        })
    }

    /// Use `listener` instead of installing OS signal handlers.
    pub fn with_signal_listener(mut self, listener: SignalListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run to completion and return the exit code of the wrapped process.
    ///
    /// `connect` builds the config backend from the token found in the
    /// bootstrap secret.
    pub async fn run<C, F>(self, connect: F) -> Result<i32, RunError>
    where
        C: ConfigBackend,
        F: FnOnce(String) -> Result<C, BackendError>,
    {
        let token = self.bootstrap_token().await?;
        let config = connect(token).map_err(RunError::Connect)?;
        let definition = self.fetch_manifest(&config).await?;
        let refs = ResolvedRefs::fetch(&definition, self.secrets.as_ref(), &config).await;

        let cancel = CancellationToken::new();
        let supervisor =
            RenewalSupervisor::new(self.secrets.clone(), self.settings.lease, cancel.clone());

        let Orchestrator {
            settings,
            secrets,
            coordinator,
            listener,
        } = self;

        let wrapped = async {
            let result = wrap(
                &settings,
                &coordinator,
                listener,
                &definition,
                &refs,
                &config,
            )
            .await;

            info!("Revoking vault token");
            if let Err(e) = secrets.revoke_self().await {
                error!("Error while revoking vault token: {}", e);
            }
            cancel.cancel();
            result
        };

        let (report, result) = tokio::join!(supervisor.run(), wrapped);
        debug!(
            attempts = report.attempts,
            failures = report.failures,
            "Renewal supervisor joined"
        );

        let exit = result?;
        if exit.escalated {
            return Err(RunError::DoubleShutdown);
        }
        Ok(exit.code())
    }

    async fn bootstrap_token(&self) -> Result<String, RunError> {
        let path = &self.settings.consul_token_path;
        let payload = self
            .secrets
            .read(path)
            .await
            .map_err(|source| RunError::Bootstrap {
                path: path.clone(),
                source,
            })?
            .filter(|payload| !payload.is_empty())
            .ok_or_else(|| RunError::BootstrapMissing { path: path.clone() })?;

        let token = payload
            .get_str(CONSUL_TOKEN_FIELD)
            .map_err(|source| RunError::BootstrapField {
                path: path.clone(),
                source,
            })?;
        debug!("Consul token: {}", redact_secret(token));
        Ok(token.to_string())
    }

    async fn fetch_manifest(
        &self,
        config: &dyn ConfigBackend,
    ) -> Result<InjectionDefinition, RunError> {
        let path = self.settings.manifest_path();
        info!("Fetching pod config from {}", path);
        let body = config
            .get_value(&path)
            .await
            .map_err(|source| RunError::Manifest {
                path: path.clone(),
                source,
            })?
            .ok_or_else(|| RunError::ManifestMissing { path: path.clone() })?;

        InjectionDefinition::parse(&body)
            .map_err(|source| RunError::ManifestMalformed { path, source })
    }
}

/// Inject, launch and wait. The listener is set up before the child exists
/// so no signal arrives unhandled.
async fn wrap(
    settings: &Settings,
    coordinator: &ProcessCoordinator,
    listener: Option<SignalListener>,
    definition: &InjectionDefinition,
    refs: &ResolvedRefs,
    config: &dyn ConfigBackend,
) -> Result<ChildExit, RunError> {
    let injector = Injector::new(config, refs, settings.app_prefix());
    let injection = injector.prepare(definition).await?;
    if injection.warnings > 0 {
        info!(
            "Continuing with {} injection warning(s)",
            injection.warnings
        );
    }

    let listener = match listener {
        Some(listener) => listener,
        None => SignalListener::install().map_err(ProcessError::from)?,
    };
    let child = coordinator.spawn(&injection.env)?;
    Ok(coordinator.supervise(child, listener).await?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backends::{MemoryConfigBackend, MemorySecretBackend, SecretPayload};
    use crate::lease::LeaseSettings;
    use crate::process::TermSignal;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const MANIFEST: &str = "kube-pod-decorator/billing/config";

    fn settings() -> Settings {
        Settings {
            application_name: "billing".into(),
            vault_secret_path: "/unused".into(),
            consul_token_path: "consul/creds/readonly".into(),
            consul_config_root: "kube-pod-decorator".into(),
            lease: LeaseSettings {
                duration_secs: 600,
                retry_interval_secs: 10,
                renewal_percentage: None,
            },
            log_level: "info".into(),
            vault_addr: "http://127.0.0.1:8200".into(),
            consul_addr: "http://127.0.0.1:8500".into(),
        }
    }

    fn backends() -> (MemorySecretBackend, MemoryConfigBackend) {
        let secrets = MemorySecretBackend::new();
        secrets.insert(
            "consul/creds/readonly",
            [("token", json!("consul-token"))].into_iter().collect(),
        );
        (secrets, MemoryConfigBackend::new())
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn orchestrator(secrets: &MemorySecretBackend, command: Vec<String>) -> Orchestrator {
        let (_tx, rx) = mpsc::channel(1);
        Orchestrator::new(settings(), Arc::new(secrets.clone()), command)
            .unwrap()
            .with_signal_listener(SignalListener::from_channel(rx))
    }

    #[tokio::test]
    async fn injects_secret_and_revokes_once() {
        let (secrets, config) = backends();
        secrets.insert(
            "secret/db",
            SecretPayload::from_iter([("password", json!("s3cr3t"))]),
        );
        config.insert(
            MANIFEST,
            r#"
env:
  - name: DB_PASS
    valueFrom:
      secretKeyRef: { name: db, key: password }
vault:
  - { name: db, path: secret/db }
"#,
        );

        let code = orchestrator(&secrets, sh(r#"test "$DB_PASS" = s3cr3t"#))
            .run(|token| {
                assert_eq!(token, "consul-token");
                Ok(config.clone())
            })
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(secrets.revocations(), 1);
    }

    #[tokio::test]
    async fn child_exit_code_is_returned() {
        let (secrets, config) = backends();
        config.insert(MANIFEST, "key: billing\n");

        let code = orchestrator(&secrets, sh("exit 7"))
            .run(|_| Ok(config.clone()))
            .await
            .unwrap();

        assert_eq!(code, 7);
        assert_eq!(secrets.revocations(), 1);
    }

    #[tokio::test]
    async fn unstartable_command_fails_after_revoke() {
        let (secrets, config) = backends();
        config.insert(MANIFEST, "key: billing\n");

        let err = orchestrator(&secrets, vec!["/nonexistent/pod-decorator-bin".into()])
            .run(|_| Ok(config.clone()))
            .await
            .unwrap_err();

        assert!(
            matches!(err, RunError::Process(ProcessError::Spawn { .. })),
            "got {err:?}"
        );
        assert_eq!(secrets.revocations(), 1);
    }

    #[tokio::test]
    async fn missing_bootstrap_secret_is_fatal() {
        let secrets = MemorySecretBackend::new();
        let config = MemoryConfigBackend::new();

        let err = orchestrator(&secrets, sh("exit 0"))
            .run(|_| Ok(config.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::BootstrapMissing { .. }));
        assert_eq!(secrets.revocations(), 0);
    }

    #[tokio::test]
    async fn bootstrap_without_token_field_is_fatal() {
        let secrets = MemorySecretBackend::new();
        secrets.insert(
            "consul/creds/readonly",
            [("token", json!(42))].into_iter().collect(),
        );

        let err = orchestrator(&secrets, sh("exit 0"))
            .run(|_| Ok(MemoryConfigBackend::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::BootstrapField { .. }));
    }

    #[tokio::test]
    async fn missing_manifest_is_fatal() {
        let (secrets, config) = backends();

        let err = orchestrator(&secrets, sh("exit 0"))
            .run(|_| Ok(config.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::ManifestMissing { .. }));
    }

    #[tokio::test]
    async fn malformed_manifest_is_fatal() {
        let (secrets, config) = backends();
        config.insert(MANIFEST, "env: {not: [a, list");

        let err = orchestrator(&secrets, sh("exit 0"))
            .run(|_| Ok(config.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::ManifestMalformed { .. }));
    }

    #[tokio::test]
    async fn broken_template_still_revokes() {
        let (secrets, config) = backends();
        let dir = tempfile::tempdir().unwrap();
        config.insert(
            MANIFEST,
            format!(
                "templates:\n  - {{ name: app.conf, destination: {} }}\n",
                dir.path().join("app.conf").display()
            ),
        );
        config.insert(
            "kube-pod-decorator/billing/templates/app.conf",
            "user={{ .USER",
        );

        let err = orchestrator(&secrets, sh("exit 0"))
            .run(|_| Ok(config.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Inject(_)));
        assert_eq!(secrets.revocations(), 1);
    }

    #[tokio::test]
    async fn second_signal_reports_double_shutdown() {
        let (secrets, config) = backends();
        config.insert(MANIFEST, "key: billing\n");
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");

        let (tx, rx) = mpsc::channel(4);
        let orchestrator = Orchestrator::new(
            settings(),
            Arc::new(secrets.clone()),
            sh(&format!(
                "trap '' INT TERM; touch {}; while :; do sleep 1; done",
                ready.display()
            )),
        )
        .unwrap()
        .with_signal_listener(SignalListener::from_channel(rx));

        let ready_path = ready.clone();
        tokio::spawn(async move {
            while !ready_path.exists() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            tx.send(TermSignal::Terminate).await.unwrap();
            tx.send(TermSignal::Terminate).await.unwrap();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(20),
            orchestrator.run(|_| Ok(config.clone())),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, RunError::DoubleShutdown));
        assert_eq!(secrets.revocations(), 1);
    }
}
