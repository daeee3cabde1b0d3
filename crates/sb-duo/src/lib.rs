//! Duo adapter (second-factor push verification).
//!
//! Implements the `sb-core` Authenticator port over the Duo Auth API v2
//! (`preauth`, async `auth`, `auth_status`).

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha512;

use sb_core::{
    auth::{Authenticator, PushStatus},
    config::DuoConfig,
    domain::Ldap,
    errors::Error,
    Result,
};

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
const DUO_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const PREAUTH_PATH: &str = "/auth/v2/preauth";
const AUTH_PATH: &str = "/auth/v2/auth";
const AUTH_STATUS_PATH: &str = "/auth/v2/auth_status";

#[derive(Clone, Debug)]
pub struct DuoClient {
    cfg: DuoConfig,
    http: reqwest::Client,
}

impl DuoClient {
    pub fn new(cfg: DuoConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Auth(format!("duo client build failed: {e}")))?;
        Ok(Self { cfg, http })
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &BTreeMap<&str, String>,
    ) -> Result<serde_json::Value> {
        let date = chrono::Utc::now().to_rfc2822();
        let body = canon_params(params);
        let sig = sign(
            &self.cfg.secret_key,
            &date,
            method.as_str(),
            &self.cfg.endpoint,
            path,
            &body,
        );

        let url = format!("https://{}{}", self.cfg.endpoint, path);
        let req = if method == reqwest::Method::GET {
            let url = if body.is_empty() {
                url
            } else {
                format!("{url}?{body}")
            };
            self.http.get(url)
        } else {
            self.http
                .request(method, url)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(body)
        };

        let resp = req
            .header(reqwest::header::DATE, &date)
            .basic_auth(&self.cfg.integration_key, Some(sig))
            .send()
            .await
            .map_err(|e| Error::Auth(format!("duo request error: {e}")))?;

        let status = resp.status();
        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("duo json error ({status}): {e}")))?;

        parse_envelope(v)
    }
}

/// Unwrap `{ "stat": "OK", "response": … }`.
fn parse_envelope(v: serde_json::Value) -> Result<serde_json::Value> {
    match v.get("stat").and_then(|s| s.as_str()) {
        Some("OK") => Ok(v.get("response").cloned().unwrap_or(serde_json::Value::Null)),
        _ => {
            let code = v.get("code").and_then(|c| c.as_i64()).unwrap_or_default();
            let message = v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            let detail = v
                .get("message_detail")
                .and_then(|m| m.as_str())
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            Err(Error::Auth(format!("duo error {code}: {message}{detail}")))
        }
    }
}

fn result_str(resp: &serde_json::Value) -> &str {
    resp.get("result").and_then(|r| r.as_str()).unwrap_or("")
}

/// `key=value` pairs sorted by key, both RFC 3986 encoded, joined with `&`.
pub fn canon_params(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, DUO_ENCODE),
                utf8_percent_encode(v, DUO_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex HMAC-SHA512 over `date\nMETHOD\nhost\npath\nparams`.
pub fn sign(
    secret_key: &str,
    date: &str,
    method: &str,
    host: &str,
    path: &str,
    canon_params: &str,
) -> String {
    let canon = [
        date.to_string(),
        method.to_uppercase(),
        host.to_lowercase(),
        path.to_string(),
        canon_params.to_string(),
    ]
    .join("\n");

    // HMAC takes keys of any length.
    let mut mac = match Hmac::<Sha512>::new_from_slice(secret_key.as_bytes()) {
        Ok(m) => m,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    mac.update(canon.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl Authenticator for DuoClient {
    async fn can_auth(&self, ldap: &Ldap) -> Result<bool> {
        let mut params = BTreeMap::new();
        params.insert("username", ldap.as_str().to_string());
        let resp = self
            .call(reqwest::Method::POST, PREAUTH_PATH, &params)
            .await?;
        let result = result_str(&resp);
        tracing::debug!("[DUO] preauth for {ldap}: {result}");
        Ok(result == "auth")
    }

    async fn start_push(&self, ldap: &Ldap, reason: &str) -> Result<String> {
        let pushinfo = format!("reason={}", utf8_percent_encode(reason, DUO_ENCODE));
        let mut params = BTreeMap::new();
        params.insert("username", ldap.as_str().to_string());
        params.insert("factor", "push".to_string());
        params.insert("device", "auto".to_string());
        params.insert("async", "1".to_string());
        params.insert("type", "Security alert".to_string());
        params.insert("pushinfo", pushinfo);

        let resp = self.call(reqwest::Method::POST, AUTH_PATH, &params).await?;
        let txid = resp
            .get("txid")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Auth("duo auth response missing txid".to_string()))?;
        tracing::info!("[DUO] Sent push to {ldap}");
        Ok(txid.to_string())
    }

    async fn push_status(&self, txid: &str) -> Result<PushStatus> {
        let mut params = BTreeMap::new();
        params.insert("txid", txid.to_string());
        let resp = self
            .call(reqwest::Method::GET, AUTH_STATUS_PATH, &params)
            .await?;
        Ok(match result_str(&resp) {
            "allow" => PushStatus::Allow,
            "deny" => PushStatus::Deny,
            _ => PushStatus::Waiting,
        })
    }
}
