//! Server-side script cache.
//!
//! Scripts are written against named slots (`@Key1`, `@IntArg2`,
//! `@StringArg1`, ...) and run with a [`ScriptArgs`] bundle. Preparing a
//! script rewrites those names into the `KEYS`/`ARGV` tables; the cache
//! then uploads the prepared body once and remembers its handle by source
//! text.
//!
//! A server can drop its loaded scripts at any time (`SCRIPT FLUSH`, a
//! restart). [`ScriptCache::eval`] handles that reactively: on `NOSCRIPT` it
//! uploads the source again, replaces the entry, and retries once. A second
//! `NOSCRIPT` in a row is [`RepoError::ScriptEvicted`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use kvrepo_store::{Command, Connection, StoreError};
use kvrepo_types::{Reply, ScriptArgs, ScriptParam, SlotKind, WireValue, decode};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RepoError;

// =============================================================================
// Prepared scripts
// =============================================================================

/// A script with its slot names rewritten to `KEYS[i]`/`ARGV[j]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedScript {
    body: String,
    keys: Vec<ScriptParam>,
    args: Vec<ScriptParam>,
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// 1-based position of `param` in `table`, appending it on first use.
fn table_position(table: &mut Vec<ScriptParam>, param: ScriptParam) -> usize {
    if let Some(position) = table.iter().position(|seen| *seen == param) {
        position.saturating_add(1)
    } else {
        table.push(param);
        table.len()
    }
}

impl PreparedScript {
    /// Rewrite every slot reference in `source`.
    ///
    /// Keys and arguments are numbered separately, in order of first
    /// appearance. `@` followed by anything that is not a slot name is left
    /// untouched.
    pub fn compile(source: &str) -> Self {
        let mut body = String::with_capacity(source.len());
        let mut keys = Vec::new();
        let mut args = Vec::new();

        let mut rest = source;
        while let Some(at) = rest.find('@') {
            let (before, from_sigil) = rest.split_at(at);
            body.push_str(before);
            let after = from_sigil.strip_prefix('@').unwrap_or(from_sigil);
            let name_len = after.find(|c| !is_name_char(c)).unwrap_or(after.len());
            let (name, tail) = after.split_at(name_len);

            match ScriptParam::parse(name) {
                Some(param) if param.kind == SlotKind::Key => {
                    let position = table_position(&mut keys, param);
                    let _ = write!(body, "KEYS[{position}]");
                }
                Some(param) => {
                    let position = table_position(&mut args, param);
                    let _ = write!(body, "ARGV[{position}]");
                }
                None => {
                    body.push('@');
                    body.push_str(name);
                }
            }
            rest = tail;
        }
        body.push_str(rest);

        Self { body, keys, args }
    }

    /// The body sent to the server.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Slots bound to `KEYS`, in table order.
    pub fn key_params(&self) -> &[ScriptParam] {
        &self.keys
    }

    /// Slots bound to `ARGV`, in table order.
    pub fn arg_params(&self) -> &[ScriptParam] {
        &self.args
    }

    /// Build the `KEYS` and `ARGV` tables from `values`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::InvalidArgument`] if the script references a key
    /// slot that was never assigned.
    pub fn bind(&self, values: &ScriptArgs) -> Result<(Vec<String>, Vec<WireValue>), RepoError> {
        let keys = self
            .keys
            .iter()
            .map(|param| {
                values
                    .key(param.index)
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| RepoError::InvalidArgument(format!("{param} is not set")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let args = self
            .args
            .iter()
            .map(|param| {
                values
                    .resolve(*param)?
                    .ok_or_else(|| RepoError::InvalidArgument(format!("{param} is not set")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((keys, args))
    }
}

// =============================================================================
// Cache
// =============================================================================

/// A loaded script: its server handle and the prepared form it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHandle {
    sha: String,
    script: Arc<PreparedScript>,
}

impl ScriptHandle {
    /// The server-side handle (`SCRIPT LOAD` result).
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// The prepared script.
    pub fn script(&self) -> &PreparedScript {
        &self.script
    }

    /// The `EVALSHA` command for one invocation with `values`.
    ///
    /// # Errors
    ///
    /// See [`PreparedScript::bind`].
    pub fn invocation(&self, values: &ScriptArgs) -> Result<Command, RepoError> {
        let (keys, args) = self.script.bind(values)?;
        Ok(Command::EvalSha {
            sha: self.sha.clone(),
            keys,
            args,
        })
    }
}

/// Source-keyed cache of loaded scripts, shared by every caller of a
/// repository.
#[derive(Debug, Default)]
pub struct ScriptCache {
    entries: RwLock<HashMap<String, ScriptHandle>>,
}

impl ScriptCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached scripts.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if nothing has been loaded yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// The cached handle for `source`, if any.
    pub async fn cached(&self, source: &str) -> Option<ScriptHandle> {
        self.entries.read().await.get(source).cloned()
    }

    async fn upload(conn: &Connection, source: &str) -> Result<ScriptHandle, RepoError> {
        let script = PreparedScript::compile(source);
        let reply = conn
            .execute(&Command::ScriptLoad {
                body: script.body.clone(),
            })
            .await?;
        let sha = decode::<String>(&reply)?
            .filter(|sha| !sha.is_empty())
            .ok_or_else(|| StoreError::Protocol("empty SCRIPT LOAD reply".to_owned()))?;
        Ok(ScriptHandle {
            sha,
            script: Arc::new(script),
        })
    }

    /// The handle for `source`, uploading it on first use.
    ///
    /// Concurrent first uses may each upload; the first handle stored wins.
    ///
    /// # Errors
    ///
    /// Returns the store error if `SCRIPT LOAD` fails.
    pub async fn get_or_load(
        &self,
        conn: &Connection,
        source: &str,
    ) -> Result<ScriptHandle, RepoError> {
        if let Some(handle) = self.cached(source).await {
            return Ok(handle);
        }

        let loaded = Self::upload(conn, source).await?;
        let mut entries = self.entries.write().await;
        let handle = entries
            .entry(source.to_owned())
            .or_insert(loaded)
            .clone();
        debug!(sha = %handle.sha, "Loaded script");
        Ok(handle)
    }

    /// Upload `source` again and replace its entry.
    ///
    /// # Errors
    ///
    /// Returns the store error if `SCRIPT LOAD` fails.
    pub async fn reload(&self, conn: &Connection, source: &str) -> Result<ScriptHandle, RepoError> {
        let handle = Self::upload(conn, source).await?;
        self.entries
            .write()
            .await
            .insert(source.to_owned(), handle.clone());
        warn!(sha = %handle.sha, "Reloaded evicted script");
        Ok(handle)
    }

    /// Run `source` with `values`, reloading it once if the server lost it.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::ScriptEvicted`] if the script is missing again
    /// right after the reload, [`RepoError::InvalidArgument`] for unset key
    /// slots, and any other store error unchanged.
    pub async fn eval(
        &self,
        conn: &Connection,
        source: &str,
        values: &ScriptArgs,
    ) -> Result<Reply, RepoError> {
        let handle = self.get_or_load(conn, source).await?;
        match conn.execute(&handle.invocation(values)?).await {
            Err(err) if err.is_no_script() => {
                let handle = self.reload(conn, source).await?;
                match conn.execute(&handle.invocation(values)?).await {
                    Err(err) if err.is_no_script() => Err(RepoError::ScriptEvicted { sha: handle.sha }),
                    result => Ok(result?),
                }
            }
            result => Ok(result?),
        }
    }
}
