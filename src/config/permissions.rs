//! Permission grants for privacy- and safety-sensitive capabilities
//!
//! Actions declare a permission tag; `safe_execute` consults this set before
//! running them. The clipboard and microphone sources check their grants on
//! every poll, so they stay silent (and never touch the device) unless the
//! permission is configured on.

use serde::Deserialize;

/// Permission tag strings used by actions and sources
pub const PERM_CLIPBOARD: &str = "clipboard";
pub const PERM_MICROPHONE: &str = "microphone";
pub const PERM_SHELL: &str = "shell_execution";
pub const PERM_FILE_OPS: &str = "file_operations";
pub const PERM_PROCESS: &str = "process_control";
pub const PERM_NETWORK: &str = "network_control";

/// Capability grants, loaded from the `[permissions]` config section
#[derive(Debug, Clone)]
pub struct Permissions {
    /// Clipboard monitoring reads everything the user copies; opt-in
    pub clipboard: bool,
    /// Microphone monitoring samples ambient audio levels; opt-in
    pub microphone: bool,
    pub shell_execution: bool,
    pub file_operations: bool,
    pub process_control: bool,
    pub network_control: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            clipboard: false,
            microphone: false,
            shell_execution: true,
            file_operations: true,
            process_control: true,
            network_control: true,
        }
    }
}

impl Permissions {
    /// Look up a grant by its tag. Unknown tags are denied.
    pub fn granted(&self, tag: &str) -> bool {
        match tag {
            PERM_CLIPBOARD => self.clipboard,
            PERM_MICROPHONE => self.microphone,
            PERM_SHELL => self.shell_execution,
            PERM_FILE_OPS => self.file_operations,
            PERM_PROCESS => self.process_control,
            PERM_NETWORK => self.network_control,
            _ => false,
        }
    }
}

/// `[permissions]` section as loaded from the config file
#[derive(Debug, Deserialize, Default)]
pub struct FilePermissions {
    pub clipboard: Option<bool>,
    pub microphone: Option<bool>,
    pub shell_execution: Option<bool>,
    pub file_operations: Option<bool>,
    pub process_control: Option<bool>,
    pub network_control: Option<bool>,
}

impl Permissions {
    pub(super) fn apply_file(&mut self, file: FilePermissions) {
        if let Some(v) = file.clipboard {
            self.clipboard = v;
        }
        if let Some(v) = file.microphone {
            self.microphone = v;
        }
        if let Some(v) = file.shell_execution {
            self.shell_execution = v;
        }
        if let Some(v) = file.file_operations {
            self.file_operations = v;
        }
        if let Some(v) = file.process_control {
            self.process_control = v;
        }
        if let Some(v) = file.network_control {
            self.network_control = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tag_is_denied() {
        let perms = Permissions::default();
        assert!(!perms.granted("telepathy"));
    }

    #[test]
    fn test_privacy_sensitive_grants_default_off() {
        let perms = Permissions::default();
        assert!(!perms.granted(PERM_CLIPBOARD));
        assert!(!perms.granted(PERM_MICROPHONE));
        assert!(perms.granted(PERM_SHELL));
    }
}
