/// Redirecting stdio before the root is assembled must not compile

use runbox::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("test".to_string())
        .harden_mount_propagation()
        .expect("propagation");

    // MountsPrivate has no redirect_stdio
    sandbox.redirect_stdio(&Default::default());
}
