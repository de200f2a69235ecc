//! Interactive remote shells driven through authentication prompts.
//!
//! A [`Connector`] produces a raw [`RemoteChannel`]; [`RemoteSession`] runs the
//! authentication automaton over it and executes sentinel-delimited commands.

mod pty;
mod session;
#[doc(hidden)]
pub mod testing;

use std::fmt;
use std::io::Write;

use tokio::sync::mpsc;
use tracing::warn;
use zeroize::Zeroizing;

use crate::config::{RetryPolicy, SessionTimeouts};
use crate::error::Result;

pub use pty::SshConnector;
pub use session::{
    DirStatus, END_SENTINEL, RemoteSession, START_SENTINEL, extract_between_sentinels,
    shell_quote, strip_ansi,
};

/// Where and how to log in.
#[derive(Clone, Default)]
pub struct AccessTarget {
    pub host: String,
    /// Program used to reach the host, `ssh` unless configured otherwise.
    pub method: String,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub private_key_file: Option<String>,
    pub private_key_password: Option<Zeroizing<String>>,
}

impl AccessTarget {
    pub fn has_credentials(&self) -> bool {
        self.password.is_some() || self.private_key_password.is_some()
    }
}

impl fmt::Debug for AccessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTarget")
            .field("host", &self.host)
            .field("method", &self.method)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_file", &self.private_key_file)
            .field(
                "private_key_password",
                &self.private_key_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Handle on whatever process backs a channel.
pub trait RemoteProcess: Send {
    fn terminate(&mut self);
}

/// Raw byte pipe to a remote login: keystrokes in, terminal output out.
///
/// The output receiver yields `None` once the remote side closed the channel.
pub struct RemoteChannel {
    pub input: Box<dyn Write + Send>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    pub process: Option<Box<dyn RemoteProcess>>,
}

/// Opens raw channels. `command` turns the login into a one-shot invocation.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &AccessTarget, command: Option<&str>) -> Result<RemoteChannel>;
}

/// Open an interactive session, retrying transient failures.
pub async fn open_with_retry(
    connector: &dyn Connector,
    target: &AccessTarget,
    timeouts: &SessionTimeouts,
    policy: &RetryPolicy,
) -> Result<RemoteSession> {
    let attempts = policy.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match RemoteSession::open(connector, target, timeouts.clone()).await {
            Ok(session) => return Ok(session),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(host = %target.host, attempt, error = %e, "remote session failed, retrying");
                attempt += 1;
                tokio::time::sleep(policy.connect_sleep()).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, FakeShell};
    use super::*;
    use crate::error::AkrunError;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            connect_attempts: attempts,
            connect_sleep_secs: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn fast_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            connect_secs: 0.5,
            command_secs: 0.5,
            prompt_probe_secs: 0.05,
        }
    }

    #[tokio::test]
    async fn refused_connections_are_retried_up_to_the_limit() {
        let connector = FakeConnector::new(FakeShell::new().refuse_connections());
        let target = AccessTarget {
            host: "cluster".into(),
            ..AccessTarget::default()
        };
        let err = open_with_retry(&connector, &target, &fast_timeouts(), &fast_policy(3))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AkrunError::RefusedConnection { .. }));
        assert_eq!(connector.connections(), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let connector = FakeConnector::new(FakeShell::new().with_password("s3cret"));
        let target = AccessTarget {
            host: "cluster".into(),
            password: Some(Zeroizing::new("wrong".into())),
            ..AccessTarget::default()
        };
        let err = open_with_retry(&connector, &target, &fast_timeouts(), &fast_policy(3))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AkrunError::AuthError { .. }));
        assert_eq!(connector.connections(), 1);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let target = AccessTarget {
            host: "h".into(),
            password: Some(Zeroizing::new("hunter2".into())),
            ..AccessTarget::default()
        };
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
