/// Detects environments where opening a browser is not possible, so the
/// device-flow URL is printed for the user to open elsewhere.
pub fn is_headless_environment() -> bool {
    if std::env::var_os("CI").is_some() || std::env::var_os("CONTINUOUS_INTEGRATION").is_some() {
        return true;
    }
    if std::env::var_os("HEADLESS").is_some() || std::env::var_os("NO_GUI").is_some() {
        return true;
    }
    #[cfg(unix)]
    {
        if std::env::var_os("DISPLAY").is_none() && std::env::var_os("WAYLAND_DISPLAY").is_none() {
            return true;
        }
    }
    false
}

/// True when device URLs should be emitted as `OAUTH_URL:{url}` on stdout
/// for a wrapping desktop app, instead of opening a browser.
pub fn is_electron_mode() -> bool {
    std::env::var("ELECTRON_OAUTH_MODE").map(|v| v == "1").unwrap_or(false)
}
