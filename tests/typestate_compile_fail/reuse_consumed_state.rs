/// A consumed state cannot be used again

use runbox::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("test".to_string());

    let _private = sandbox.harden_mount_propagation();

    // sandbox was moved by the first transition
    let _ = sandbox.harden_mount_propagation();
}
