use vigil_core::types::Role;

/// Who this daemon process is: role, PID, launch identity, and build
/// version. Threaded explicitly through constructors; there is no ambient
/// "current identity" global.
#[derive(Debug, Clone)]
pub struct Identity {
    pub role: Role,
    pub pid: u32,
    /// The generated name this process was launched under.
    pub process_name: String,
    pub app_version: String,
}

impl Identity {
    pub fn new(role: Role, process_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            role,
            pid: std::process::id(),
            process_name: process_name.into(),
            app_version: app_version.into(),
        }
    }
}
