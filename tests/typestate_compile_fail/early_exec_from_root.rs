/// Exec right after root assembly, before limits and privilege drop, must not compile

use runbox::kernel::mount::MountPlan;
use runbox::preexec::{FreshChild, Sandbox};
use runbox::config::parse_config;
use runbox::RootfsSource;

fn main() {
    let config = parse_config(r#"{"rootfs": "/srv/rootfs", "cwd": "/", "command": ["true"]}"#)
        .expect("config");
    let plan = MountPlan::build(&RootfsSource::Directory("/srv/rootfs".into()), &[])
        .expect("plan");

    let sandbox = Sandbox::<FreshChild>::new("test".to_string())
        .harden_mount_propagation()
        .expect("propagation")
        .assemble_root(&plan, &config)
        .expect("root");

    // RootReady has no exec_payload
    sandbox.exec_payload(&config.command);
}
