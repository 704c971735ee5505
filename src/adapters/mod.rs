use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::device::DeviceResolver;

#[cfg(target_os = "linux")]
mod linux;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxResolver;
pub use simulated::{SimulatedResolver, Simulator};

/// Pick the resolver for this run. Simulation mode reads device commands
/// from stdin: `add <name> <size_gb> [mount]` and `rm <name>`.
pub fn get_resolver(simulation: bool) -> Arc<dyn DeviceResolver> {
    if simulation {
        let (resolver, controller) = SimulatedResolver::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines() {
                let Ok(cmd) = line else {
                    break;
                };
                run_simulator_command(&controller, &cmd);
            }
        });

        return Arc::new(resolver);
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxResolver)
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("No device resolver for this platform, using an empty simulated one");
        Arc::new(SimulatedResolver::default())
    }
}

fn run_simulator_command(controller: &Simulator, cmd: &str) {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    match parts.as_slice() {
        ["add", name, size, rest @ ..] => match size.parse::<u64>() {
            Ok(size_gb) => {
                let mount = rest.first().map(PathBuf::from);
                controller.add_device(name, size_gb, mount);
                info!(device = %name, size_gb, "Simulated device added");
            }
            Err(_) => warn!(input = %size, "Size must be a whole number of GiB"),
        },
        ["rm", name] => {
            controller.remove_device(name);
            info!(device = %name, "Simulated device removed");
        }
        [] => {}
        _ => warn!("(Simulator) Use: 'add <name> <size_gb> [mount]' or 'rm <name>'"),
    }
}
