/// Reaching ExecReady without locking privileges must not compile

use runbox::preexec::{CredsDropped, Sandbox};

fn finish(sandbox: Sandbox<CredsDropped>) {
    // CredsDropped has no ready_for_exec
    let ready = sandbox.ready_for_exec();
    let _ = ready.exec_payload(&["true".to_string()]);
}

fn main() {}
