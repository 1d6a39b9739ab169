//! `linsk shell`: boot and drop into an interactive guest shell. Useful for
//! formatting drives and debugging; networking is unrestricted so packages
//! can be pulled inside the session.

use tracing::error;

use super::runvm::{EXIT_ERROR, EXIT_OK};
use super::{log_tap_link, parse_forward_port_rules, prepare_and_run_vm, CommonFlags};

pub async fn cmd_shell(
    common: &CommonFlags,
    passthrough: Option<String>,
    forward_ports: Option<String>,
    enable_net_tap: bool,
) -> i32 {
    let forward_rules = match forward_ports.as_deref() {
        None => Vec::new(),
        Some(spec) => match parse_forward_port_rules(spec) {
            Ok(rules) => rules,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to parse port forwarding rules");
                return EXIT_ERROR;
            }
        },
    };

    prepare_and_run_vm(
        common,
        passthrough.as_deref(),
        forward_rules,
        true,
        enable_net_tap,
        true,
        |handles| async move {
            log_tap_link(handles.net_tap.as_deref());

            let shell_result = match handles.vm.ssh() {
                Ok(access) => access.interactive_shell().await,
                Err(err) => Err(err),
            };

            if let Err(err) = shell_result {
                error!(error = %format!("{err:#}"), "failed to run VM shell");
                return EXIT_ERROR;
            }

            EXIT_OK
        },
    )
    .await
}
