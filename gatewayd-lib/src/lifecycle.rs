//! Couples auth verdicts, firewall rule changes, and client-table transitions into one
//! serialized-per-client operation. Shared by `HttpFront::auth` (per-request) and
//! `Scheduler`'s counter-and-decide tick.

use std::time::SystemTime;

use crate::auth_client::Verdict;
use crate::client_table::{Client, ClientTable, Counters, Mark};
use crate::firewall::FirewallBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// promoted to (or already) `Known`
    Allowed,
    /// rules removed and entry deleted
    Denied,
    /// still in a probation/validation holding pattern
    Pending,
    /// demoted to `Locked`, rules left in place
    Locked,
    /// transport or firewall hiccup; caller should retry next tick
    Retry,
}

/// Applies the auth server's verdict to a client's session state. `client` must be the
/// caller's most recent read of the session; the table is re-consulted by token before
/// any mutation so a session deleted concurrently is a no-op rather than a panic.
pub fn apply_verdict(table: &ClientTable, firewall: &dyn FirewallBackend, client: &Client, verdict: Verdict) -> Outcome {
    match verdict {
        Verdict::Allowed if client.mark == Mark::Known => Outcome::Allowed,
        Verdict::Allowed => match firewall.allow(&client.ip, &client.mac, Mark::Known) {
            Ok(()) => {
                let _ = table.update_by_token(&client.token, |c| {
                    c.mark = Mark::Known;
                    c.counters = Counters::default();
                    c.last_updated = SystemTime::now();
                });
                Outcome::Allowed
            }
            Err(e) => {
                tracing::warn!(error = %e, ip = %client.ip, "firewall rejected promotion to known, client stays pending");
                Outcome::Retry
            }
        },
        Verdict::Denied | Verdict::ValidationFailed => {
            firewall.deny(&client.ip, &client.mac, client.mark);
            table.delete_by_token(&client.token);
            Outcome::Denied
        }
        Verdict::Validation => {
            let _ = table.update_by_token(&client.token, |c| c.mark = Mark::Validation);
            Outcome::Pending
        }
        Verdict::Locked => {
            firewall.deny(&client.ip, &client.mac, client.mark);
            match firewall.allow(&client.ip, &client.mac, Mark::Locked) {
                Ok(()) => {
                    let _ = table.update_by_token(&client.token, |c| c.mark = Mark::Locked);
                    Outcome::Locked
                }
                Err(e) => {
                    tracing::warn!(error = %e, ip = %client.ip, "firewall rejected locked mark install, client stays as-is");
                    Outcome::Retry
                }
            }
        }
        Verdict::Error => Outcome::Retry,
    }
}

/// Force-evicts an inactive client: deny + delete + best-effort logout.
pub fn evict<T: crate::auth_client::AuthTransport>(
    table: &ClientTable,
    firewall: &dyn FirewallBackend,
    auth: &crate::auth_client::AuthClient<T>,
    client: &Client,
) {
    firewall.deny(&client.ip, &client.mac, client.mark);
    table.delete_by_token(&client.token);
    auth.logout(&client.token, &client.ip, &client.mac, client.counters.incoming, client.counters.outgoing);
}
