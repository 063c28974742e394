// Startup module - banner and module status printed before the engine runs

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner and a summary of what is enabled.
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}sigrelay{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Local event routing for host signals{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!("  {DIM}Store:{RESET}  {}", config.db_path.display());
    println!();

    let perm = |granted: bool| if granted { GREEN } else { DIM };
    let p = &config.permissions;
    println!("  {DIM}Permissions:{RESET}");
    println!("    {}shell_execution{RESET}", perm(p.shell_execution));
    println!("    {}file_operations{RESET}", perm(p.file_operations));
    println!("    {}process_control{RESET}", perm(p.process_control));
    println!("    {}network_control{RESET}", perm(p.network_control));
    if p.clipboard {
        println!("    {YELLOW}clipboard{RESET} {DIM}(monitoring enabled){RESET}");
    } else {
        println!("    {DIM}clipboard (off){RESET}");
    }
    if p.microphone {
        println!("    {YELLOW}microphone{RESET} {DIM}(monitoring enabled){RESET}");
    } else {
        println!("    {DIM}microphone (off){RESET}");
    }
    println!();

    if config.signals.watch_paths.is_empty() {
        println!("  {DIM}Filesystem watch: no paths configured{RESET}");
    } else {
        println!(
            "  {DIM}Filesystem watch:{RESET} {} path(s)",
            config.signals.watch_paths.len()
        );
    }

    println!(
        "  {MAGENTA}▸{RESET} Listening on {BOLD}{}{RESET}",
        config.bind_addr
    );
    println!();
}
