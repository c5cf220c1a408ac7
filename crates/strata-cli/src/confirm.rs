use std::io::IsTerminal;

use dialoguer::Confirm;
use tracing::warn;

/// Ask before marking `count` migrations rolled back.
/// Without a terminal there is nobody to ask, so the answer is no.
pub fn confirm_rollback(count: usize) -> bool {
    if !std::io::stdin().is_terminal() {
        println!("Non-interactive environment detected.");
        println!("Re-run with --yes to roll back without a prompt.");
        return false;
    }

    let prompt = format!(
        "Mark {count} migration{} as rolled back? The schema itself is not changed",
        if count == 1 { "" } else { "s" }
    );
    match Confirm::new().with_prompt(prompt).default(false).interact() {
        Ok(answer) => answer,
        Err(e) => {
            warn!("confirmation prompt failed: {e}");
            false
        }
    }
}
