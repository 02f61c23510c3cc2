// src/discovery/auth.rs
//
// Kubeconfig parsing and the derived auth material used to authenticate
// discovery requests against the cluster. Re-derived only when the
// kubeconfig file's bytes change (see `KubeconfigWatch`).

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum AuthMaterial {
    Bearer(String),
    Basic { username: String, password: String },
    ClientCert { cert_pem: Vec<u8>, key_pem: Vec<u8> },
    None,
}

impl AuthMaterial {
    /// Applies this auth material to an outgoing request builder.
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthMaterial::Bearer(token) => builder.bearer_auth(token),
            AuthMaterial::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            AuthMaterial::ClientCert { .. } | AuthMaterial::None => builder,
        }
    }

    /// Returns a TLS client identity to attach to the `reqwest::Client`, if
    /// this auth material is certificate-based.
    pub fn identity(&self) -> Result<Option<reqwest::Identity>> {
        match self {
            AuthMaterial::ClientCert { cert_pem, key_pem } => {
                let mut pem = cert_pem.clone();
                pem.extend_from_slice(key_pem);
                let identity = reqwest::Identity::from_pem(&pem)
                    .context("building TLS identity from kubeconfig client cert/key")?;
                Ok(Some(identity))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context")]
    current_context: String,
    contexts: Vec<NamedContext>,
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextDetails,
}

#[derive(Debug, Deserialize)]
struct ContextDetails {
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserDetails,
}

#[derive(Debug, Deserialize, Default)]
struct UserDetails {
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<PathBuf>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
}

/// Parses raw kubeconfig bytes and derives the auth material for the current
/// context's user, per the preference order: bearer, basic, client cert,
/// none.
pub fn derive_auth_material(kubeconfig_bytes: &[u8], kubeconfig_dir: &Path) -> Result<AuthMaterial> {
    let kubeconfig: Kubeconfig =
        serde_yaml::from_slice(kubeconfig_bytes).context("parsing kubeconfig YAML")?;

    let ctx = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == kubeconfig.current_context)
        .with_context(|| format!("current-context {} not found in kubeconfig", kubeconfig.current_context))?;

    let user = kubeconfig
        .users
        .iter()
        .find(|u| u.name == ctx.context.user)
        .with_context(|| format!("user {} not found in kubeconfig", ctx.context.user))?;

    let u = &user.user;

    if let Some(token) = &u.token {
        return Ok(AuthMaterial::Bearer(token.clone()));
    }

    if let (Some(username), Some(password)) = (&u.username, &u.password) {
        return Ok(AuthMaterial::Basic {
            username: username.clone(),
            password: password.clone(),
        });
    }

    let cert_pem = read_pem_field(&u.client_certificate_data, &u.client_certificate, kubeconfig_dir)?;
    let key_pem = read_pem_field(&u.client_key_data, &u.client_key, kubeconfig_dir)?;

    if let (Some(cert_pem), Some(key_pem)) = (cert_pem, key_pem) {
        return Ok(AuthMaterial::ClientCert { cert_pem, key_pem });
    }

    Ok(AuthMaterial::None)
}

fn read_pem_field(
    inline_b64: &Option<String>,
    file: &Option<PathBuf>,
    kubeconfig_dir: &Path,
) -> Result<Option<Vec<u8>>> {
    if let Some(b64) = inline_b64 {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .context("decoding base64 kubeconfig field")?;
        return Ok(Some(decoded));
    }

    if let Some(path) = file {
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            kubeconfig_dir.join(path)
        };
        let bytes = std::fs::read(&resolved)
            .with_context(|| format!("reading kubeconfig-referenced file {}", resolved.display()))?;
        return Ok(Some(bytes));
    }

    Ok(None)
}

/// Tracks the kubeconfig's raw bytes and re-derives `AuthMaterial` only when
/// they change, avoiding a reparse on every discovery attempt.
pub struct KubeconfigWatch {
    path: PathBuf,
    last_bytes: Option<Vec<u8>>,
    material: AuthMaterial,
}

impl KubeconfigWatch {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_bytes: None,
            material: AuthMaterial::None,
        }
    }

    /// Re-reads the kubeconfig file and, if its bytes changed, re-derives the
    /// auth material. Fails if the file cannot be read at all.
    pub async fn refresh(&mut self) -> Result<&AuthMaterial> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading kubeconfig at {}", self.path.display()))?;

        if self.last_bytes.as_deref() != Some(&bytes) {
            let dir = self.path.parent().unwrap_or(Path::new("."));
            self.material = derive_auth_material(&bytes, dir)?;
            self.last_bytes = Some(bytes);
        }

        Ok(&self.material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kubeconfig(user_block: &str) -> Vec<u8> {
        format!(
            r#"
current-context: default
contexts:
  - name: default
    context:
      user: admin
users:
  - name: admin
    user:
{user_block}
"#
        )
        .into_bytes()
    }

    #[test]
    fn bearer_token_takes_priority() {
        let bytes = kubeconfig("      token: abc123");
        let material = derive_auth_material(&bytes, Path::new(".")).unwrap();
        assert!(matches!(material, AuthMaterial::Bearer(t) if t == "abc123"));
    }

    #[test]
    fn basic_auth_when_no_token() {
        let bytes = kubeconfig("      username: alice\n      password: hunter2");
        let material = derive_auth_material(&bytes, Path::new(".")).unwrap();
        match material {
            AuthMaterial::Basic { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "hunter2");
            }
            other => panic!("expected Basic, got {other:?}"),
        }
    }

    #[test]
    fn client_cert_from_inline_data() {
        let cert_b64 = base64::engine::general_purpose::STANDARD.encode("CERT");
        let key_b64 = base64::engine::general_purpose::STANDARD.encode("KEY");
        let bytes = kubeconfig(&format!(
            "      client-certificate-data: {cert_b64}\n      client-key-data: {key_b64}"
        ));
        let material = derive_auth_material(&bytes, Path::new(".")).unwrap();
        match material {
            AuthMaterial::ClientCert { cert_pem, key_pem } => {
                assert_eq!(cert_pem, b"CERT");
                assert_eq!(key_pem, b"KEY");
            }
            other => panic!("expected ClientCert, got {other:?}"),
        }
    }

    #[test]
    fn none_when_user_has_no_credentials() {
        let bytes = kubeconfig("      {}");
        let material = derive_auth_material(&bytes, Path::new(".")).unwrap();
        assert!(matches!(material, AuthMaterial::None));
    }

    #[tokio::test]
    async fn watch_reparses_only_on_byte_change() {
        let dir = tempfile_dir();
        let path = dir.join("kubeconfig");
        tokio::fs::write(&path, kubeconfig("      token: one")).await.unwrap();

        let mut watch = KubeconfigWatch::new(path.clone());
        let first = watch.refresh().await.unwrap().clone();
        assert!(matches!(first, AuthMaterial::Bearer(t) if t == "one"));

        // Unchanged bytes: re-refresh should keep returning the cached value
        // without erroring even if we (hypothetically) broke parsing.
        let second = watch.refresh().await.unwrap().clone();
        assert!(matches!(second, AuthMaterial::Bearer(t) if t == "one"));

        tokio::fs::write(&path, kubeconfig("      token: two")).await.unwrap();
        let third = watch.refresh().await.unwrap().clone();
        assert!(matches!(third, AuthMaterial::Bearer(t) if t == "two"));

        tokio::fs::remove_file(&path).await.ok();
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hacox-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
