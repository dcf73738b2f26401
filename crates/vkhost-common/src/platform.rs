/// Returns the default location of the host configuration file.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\vkhost\vkhost.toml` (Windows) or `/etc/vkhost/vkhost.toml`
/// 2. Local fallback: `./vkhost.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\vkhost\vkhost.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/vkhost/vkhost.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "vkhost.toml".to_string()
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}
