//! Hot-reload behavior: a changed script file ends the run loop, and the
//! supervisor re-executes the new content in a fresh runtime.

use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netlua::script::ScriptRuntime;
use netlua::Supervisor;

/// Push the file's mtime forward so the watcher sees a change without the
/// test having to straddle a filesystem timestamp boundary.
fn bump_mtime(path: &Path) {
    let f = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("Should open script");
    let mtime = f
        .metadata()
        .expect("Should stat")
        .modified()
        .expect("Should read mtime");
    f.set_modified(mtime + Duration::from_secs(5))
        .expect("Should set mtime");
}

#[test]
fn test_script_change_ends_the_run_loop() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let path = dir.path().join("main.lua");
    std::fs::write(
        &path,
        r#"
        srv = NetEventManager({ listening_port = 0 })
        srv:run()
        after_run = true
        "#,
    )
    .expect("Should write script");

    let runtime = ScriptRuntime::new(path.clone(), Arc::new(AtomicUsize::new(0)))
        .expect("Should create runtime");

    let toucher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        bump_mtime(&path);
    });

    let start = Instant::now();
    runtime.exec().expect("Should return after the file changed");
    // ~0.3 s until the touch, ≤ ~1 s watcher throttle, one 200 ms quantum.
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "run loop did not notice the change in time"
    );
    let after: bool = runtime
        .lua()
        .globals()
        .get("after_run")
        .expect("Should read global");
    assert!(after);
    toucher.join().expect("Should join toucher");
}

#[test]
fn test_supervisor_restarts_with_new_content() {
    // Probe for a free port; the scripts need a fixed one so the test can
    // tell which version is serving.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("Should bind probe");
        probe.local_addr().expect("Should read addr").port()
    };

    let dir = tempfile::tempdir().expect("Should create temp dir");
    let path = dir.path().join("main.lua");
    let script_v1 = format!(
        r#"
        srv = NetEventManager({{ listening_port = "127.0.0.1:{port}" }})
        srv.onaccept = function(self, conn)
            conn:send("v1")
            return true
        end
        srv:run()
        "#
    );
    let script_v2 = script_v1.replace("v1", "v2");
    std::fs::write(&path, &script_v1).expect("Should write script");

    let supervisor = Supervisor::new(path.clone());
    let flag = supervisor.termination_flag();
    let worker = std::thread::spawn(move || supervisor.run());

    // Connect-and-read until the expected greeting shows up; the old
    // generation may keep serving briefly after a swap.
    let greeting_becomes = |want: &str, deadline: Duration| -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if let Ok(mut c) = std::net::TcpStream::connect(("127.0.0.1", port)) {
                c.set_read_timeout(Some(Duration::from_secs(2)))
                    .expect("Should set timeout");
                let mut buf = Vec::new();
                use std::io::Read as _;
                if c.read_to_end(&mut buf).is_ok()
                    && String::from_utf8_lossy(&buf) == want
                {
                    return true;
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        false
    };

    // First generation serves v1.
    assert!(
        greeting_becomes("v1", Duration::from_secs(10)),
        "first script generation never answered"
    );

    // Swap the script and nudge the mtime; the run loop must exit and the
    // supervisor must execute the new file.
    {
        let mut f = std::fs::File::create(&path).expect("Should rewrite script");
        f.write_all(script_v2.as_bytes()).expect("Should write v2");
    }
    bump_mtime(&path);

    assert!(
        greeting_becomes("v2", Duration::from_secs(15)),
        "reload did not pick up the new script content"
    );

    flag.store(15, Ordering::Relaxed);
    worker
        .join()
        .expect("Should join supervisor")
        .expect("supervisor run should succeed");
}
