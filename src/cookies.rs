//! Session-cookie probe.

use cdp_adapter::{AdapterError, Cookie, Session};

/// Reports whether the browser holds a session cookie named `name`.
///
/// Mirrors the behaviour this probe has always had: any cookie at all counts
/// as a session cookie and `name` is not compared.
// TODO: decide whether `name` should filter the list; callers currently rely
// on "any cookie present" meaning "logged in".
pub async fn has_session_cookie(session: &Session, name: &str) -> Result<bool, AdapterError> {
    let cookies = session.cookies().await?;
    Ok(session_cookie_present(&cookies, name))
}

pub fn session_cookie_present(cookies: &[Cookie], _name: &str) -> bool {
    !cookies.is_empty()
}
