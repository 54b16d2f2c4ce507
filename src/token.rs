//! User token acquisition for a container's processes (spec §4.8, §9
//! "Token lifetime"). A container is a single identity: the token minted
//! or opened for its first process is cached and reused for every
//! subsequent exec within that container.

use crate::error::{Error, Result};
use crate::external::{AccountRole, UserDirectory, UserToken};

const INHERIT_USER_ANNOTATION: &str = "host-process.inherit-user";
const ACCOUNT_ROLE_ANNOTATION: &str = "host-process.account-role";

/// Decides, once per container, how to obtain the token subsequent
/// `create-process` calls reuse.
pub enum TokenSource<'a> {
    /// `host-process.inherit-user = "true"`: use the current process's token.
    InheritCurrentProcess,
    /// Log on as a named, pre-existing account.
    Named { user: &'a str, domain: &'a str, password: &'a str },
    /// Mint an ephemeral local account in the role's group, then log on as it.
    Ephemeral { account_prefix: &'a str, role: AccountRole },
}

pub fn resolve_source<'a>(
    annotations: &'a [(String, String)],
    named: Option<(&'a str, &'a str, &'a str)>,
    account_prefix: &'a str,
) -> TokenSource<'a> {
    let inherit = annotations
        .iter()
        .find(|(k, _)| k == INHERIT_USER_ANNOTATION)
        .map(|(_, v)| v == "true")
        .unwrap_or(false);
    if inherit {
        return TokenSource::InheritCurrentProcess;
    }
    if let Some((user, domain, password)) = named {
        return TokenSource::Named { user, domain, password };
    }
    let role = AccountRole::from_annotation(
        annotations
            .iter()
            .find(|(k, _)| k == ACCOUNT_ROLE_ANNOTATION)
            .map(|(_, v)| v.as_str()),
    );
    TokenSource::Ephemeral { account_prefix, role }
}

/// The outcome of minting/opening a token: the token itself, and — if an
/// ephemeral account was created — its name, so the container can delete it
/// on close.
pub struct AcquiredToken {
    pub token: UserToken,
    pub ephemeral_account: Option<String>,
}

pub fn acquire(
    directory: &dyn UserDirectory,
    source: TokenSource<'_>,
) -> Result<AcquiredToken> {
    match source {
        TokenSource::InheritCurrentProcess => Ok(AcquiredToken {
            token: open_current_process_token()?,
            ephemeral_account: None,
        }),
        TokenSource::Named { user, domain, password } => Ok(AcquiredToken {
            token: directory.logon(user, domain, password)?,
            ephemeral_account: None,
        }),
        TokenSource::Ephemeral { account_prefix, role } => {
            let name = format!("{account_prefix}-{}", short_random_suffix());
            let password = generate_password();
            let sid = directory.add_local_user(&name, &password)?;
            directory.add_user_to_group(&sid, role.local_group_name())?;
            let token = directory.logon(&name, ".", &password)?;
            Ok(AcquiredToken {
                token,
                ephemeral_account: Some(name),
            })
        }
    }
}

#[cfg(windows)]
fn open_current_process_token() -> Result<UserToken> {
    use windows::Win32::Security::TOKEN_ALL_ACCESS;
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    let mut handle = windows::Win32::Foundation::HANDLE::default();
    unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_ALL_ACCESS, &mut handle) }
        .map_err(|e| Error::from_windows_error("OpenProcessToken", &e))?;
    Ok(UserToken { handle })
}

#[cfg(not(windows))]
fn open_current_process_token() -> Result<UserToken> {
    Err(Error::not_supported("token acquisition is only available on Windows"))
}

/// Not cryptographically significant — ephemeral account names only need to
/// avoid colliding with a prior container's leftover account within the
/// same boot.
fn short_random_suffix() -> String {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{seed:08x}")
}

fn generate_password() -> String {
    let suffix = short_random_suffix();
    format!("Jc!{suffix}Aa1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherit_annotation_wins_over_named_and_ephemeral() {
        let annotations = vec![(INHERIT_USER_ANNOTATION.to_string(), "true".to_string())];
        let source = resolve_source(&annotations, Some(("bob", ".", "pw")), "jc");
        assert!(matches!(source, TokenSource::InheritCurrentProcess));
    }

    #[test]
    fn default_role_is_user_without_annotation() {
        let annotations = vec![];
        let source = resolve_source(&annotations, None, "jc");
        match source {
            TokenSource::Ephemeral { role, .. } => assert_eq!(role, AccountRole::User),
            _ => panic!("expected ephemeral token source"),
        }
    }
}
