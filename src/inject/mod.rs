//! Injection of resolved values into the wrapped process: environment
//! variables, verbatim files and rendered templates.

pub mod resolver;
pub mod template;

pub use resolver::{resolve_env, ResolveError, Resolution, ResolvedRefs};
pub use template::{Rendered, Template, TemplateError};

use crate::backends::ConfigBackend;
use crate::config::{BodyFolder, FileSource, InjectionDefinition, TemplateSource};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument, Span};

/// Only malformed templates stop the run; everything else is logged.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// What was prepared for the wrapped process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Injection {
    /// Resolved variables, to be layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub written: Vec<PathBuf>,
    pub warnings: usize,
}

/// Resolves the manifest against fetched references and writes files.
pub struct Injector<'a> {
    config: &'a dyn ConfigBackend,
    refs: &'a ResolvedRefs,
    app_prefix: String,
    span: Span,
}

impl<'a> Injector<'a> {
    /// `app_prefix` is `<config_root>/<application_name>`.
    pub fn new(config: &'a dyn ConfigBackend, refs: &'a ResolvedRefs, app_prefix: String) -> Self {
        let span = info_span!("inject", app = %app_prefix);
        Self {
            config,
            refs,
            app_prefix,
            span,
        }
    }

    pub async fn prepare(
        &self,
        definition: &InjectionDefinition,
    ) -> Result<Injection, InjectError> {
        self.prepare_inner(definition)
            .instrument(self.span.clone())
            .await
    }

    async fn prepare_inner(
        &self,
        definition: &InjectionDefinition,
    ) -> Result<Injection, InjectError> {
        let mut injection = Injection::default();

        info!("Processing environment variables");
        let resolution = resolve_env(&definition.env, self.refs);
        injection.warnings += resolution.warnings.len();
        injection.env = resolution.values;

        info!("Processing files");
        for file in &definition.files {
            if let Some(path) = self.write_file(file).await {
                injection.written.push(path);
            } else {
                injection.warnings += 1;
            }
        }

        info!("Processing templates");
        for template in &definition.templates {
            let (written, warnings) = self.write_template(template).await?;
            injection.warnings += warnings;
            injection.written.extend(written);
        }

        info!(
            env = injection.env.len(),
            files = injection.written.len(),
            warnings = injection.warnings,
            "Injection prepared"
        );
        Ok(injection)
    }

    fn body_path(&self, folder: BodyFolder, name: &str) -> String {
        format!("{}/{}/{}", self.app_prefix, folder.as_str(), name)
    }

    async fn fetch_body(&self, folder: BodyFolder, name: &str) -> Option<Vec<u8>> {
        match self.config.get_value(&self.body_path(folder, name)).await {
            Ok(Some(body)) => Some(body),
            Ok(None) => {
                warn!("Could not get {} {}: no value stored", folder.as_str(), name);
                None
            }
            Err(e) => {
                warn!("Could not get {} {}: {}", folder.as_str(), name, e);
                None
            }
        }
    }

    async fn write_file(&self, file: &FileSource) -> Option<PathBuf> {
        info!("Processing file {}", file.name);
        let body = self.fetch_body(BodyFolder::Files, &file.name).await?;

        info!("Writing file {} to {}", file.name, file.destination.display());
        match write_destination(&file.destination, &body).await {
            Ok(()) => Some(file.destination.clone()),
            Err(e) => {
                error!("Error while writing file {}: {}", file.destination.display(), e);
                None
            }
        }
    }

    /// Returns the written path (if any) and the number of warnings raised.
    async fn write_template(
        &self,
        source: &TemplateSource,
    ) -> Result<(Option<PathBuf>, usize), InjectError> {
        info!("Processing template {}", source.name);
        let Some(body) = self.fetch_body(BodyFolder::Templates, &source.name).await else {
            return Ok((None, 1));
        };

        let template = Template::parse(&source.name, &String::from_utf8_lossy(&body))?;
        let resolution = resolve_env(&source.env, self.refs);
        let rendered = template.render(&resolution.values);
        let mut warnings = resolution.warnings.len();
        if !rendered.missing.is_empty() {
            warn!(
                "Templating of {} left {} placeholder(s) empty: {}",
                source.name,
                rendered.missing.len(),
                rendered.missing.join(", ")
            );
            warnings += rendered.missing.len();
        }

        info!(
            "Writing templated file {} to {}",
            source.name,
            source.destination.display()
        );
        match write_destination(&source.destination, rendered.output.as_bytes()).await {
            Ok(()) => Ok((Some(source.destination.clone()), warnings)),
            Err(e) => {
                error!(
                    "File creation failure {}: {}",
                    source.destination.display(),
                    e
                );
                Ok((None, warnings + 1))
            }
        }
    }
}

/// Write `contents` to `destination` with mode 0644, creating parent
/// directories with mode 0777 (before umask).
pub async fn write_destination(destination: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o777);
        if let Err(e) = builder.create(parent).await {
            error!(
                "Unable to create directory '{}' for '{}': {}",
                parent.display(),
                destination.display(),
                e
            );
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    let mut file = options.open(destination).await?;

    use tokio::io::AsyncWriteExt;
    file.write_all(contents).await?;
    file.flush().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(destination, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryConfigBackend;
    use crate::config::{EnvVar, Reference};
    use serde_json::json;

    const PREFIX: &str = "kube-pod-decorator/billing";

    fn refs() -> ResolvedRefs {
        let mut refs = ResolvedRefs::new();
        refs.insert_secret(
            Reference {
                name: "db".into(),
                kind: String::new(),
                path: "secret/data/db".into(),
            },
            [("password", json!("s3cr3t"))].into_iter().collect(),
        );
        refs
    }

    #[tokio::test]
    async fn writes_files_and_templates_under_new_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfigBackend::new();
        config.insert(&format!("{PREFIX}/files/ca.pem"), "-----CERT-----");
        config.insert(
            &format!("{PREFIX}/templates/app.conf"),
            "user={{ .USER }}\npass={{ .PASS }}\n",
        );
        let refs = refs();

        let ca = dir.path().join("ssl/nested/ca.pem");
        let conf = dir.path().join("etc/app.conf");
        let definition = InjectionDefinition {
            env: vec![EnvVar::from_secret("DB_PASS", "db", "password")],
            files: vec![FileSource {
                name: "ca.pem".into(),
                destination: ca.clone(),
            }],
            templates: vec![TemplateSource {
                name: "app.conf".into(),
                destination: conf.clone(),
                env: vec![
                    EnvVar::literal("USER", "billing"),
                    EnvVar::from_secret("PASS", "db", "password"),
                ],
            }],
            ..Default::default()
        };

        let injector = Injector::new(&config, &refs, PREFIX.to_string());
        let injection = injector.prepare(&definition).await.unwrap();

        assert_eq!(injection.env["DB_PASS"], "s3cr3t");
        assert_eq!(injection.warnings, 0);
        assert_eq!(injection.written, vec![ca.clone(), conf.clone()]);
        assert_eq!(std::fs::read_to_string(&ca).unwrap(), "-----CERT-----");
        assert_eq!(
            std::fs::read_to_string(&conf).unwrap(),
            "user=billing\npass=s3cr3t\n"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&ca).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn missing_file_body_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfigBackend::new();
        let refs = ResolvedRefs::new();
        let destination = dir.path().join("missing.txt");

        let definition = InjectionDefinition {
            files: vec![FileSource {
                name: "missing.txt".into(),
                destination: destination.clone(),
            }],
            ..Default::default()
        };

        let injection = Injector::new(&config, &refs, PREFIX.to_string())
            .prepare(&definition)
            .await
            .unwrap();
        assert!(injection.written.is_empty());
        assert_eq!(injection.warnings, 1);
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn malformed_template_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfigBackend::new();
        config.insert(&format!("{PREFIX}/templates/bad"), "{{ .OPEN");
        let refs = ResolvedRefs::new();

        let definition = InjectionDefinition {
            templates: vec![TemplateSource {
                name: "bad".into(),
                destination: dir.path().join("bad"),
                env: vec![],
            }],
            ..Default::default()
        };

        let err = Injector::new(&config, &refs, PREFIX.to_string())
            .prepare(&definition)
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Template(TemplateError::Unclosed { .. })));
        assert!(!dir.path().join("bad").exists());
    }

    #[tokio::test]
    async fn template_with_unresolved_placeholder_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfigBackend::new();
        config.insert(&format!("{PREFIX}/templates/t"), "a={{ .A }}");
        let refs = ResolvedRefs::new();
        let destination = dir.path().join("t");

        let definition = InjectionDefinition {
            templates: vec![TemplateSource {
                name: "t".into(),
                destination: destination.clone(),
                env: vec![EnvVar::from_secret("A", "nope", "k")],
            }],
            ..Default::default()
        };

        let injection = Injector::new(&config, &refs, PREFIX.to_string())
            .prepare(&definition)
            .await
            .unwrap();
        // one unresolved variable plus one empty placeholder
        assert_eq!(injection.warnings, 2);
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "a=");
    }
}
