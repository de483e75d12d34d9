/// Exec straight from a fresh child must not compile

use runbox::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("test".to_string());

    // FreshChild has no exec_payload
    sandbox.exec_payload(&["echo".to_string()]);
}
