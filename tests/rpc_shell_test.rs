//! Operator surfaces: the interactive shell and the TCP server driving a live
//! simulated camera.

mod common;

use serde_json::json;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use camstack::rpc::{self, RpcServer};
use camstack::SupervisorState;
use common::sim_rig;

#[tokio::test]
async fn test_shell_session_changes_mode() {
    let rig = sim_rig();
    rig.sup.initialize(None, false).await.expect("initialize");

    let script = b"state\nset_camera_mode HALF\nget_camera_mode\nprm_setvalue 42 DETGAIN 0x00a1\nbogus\nquit\nstate\n";
    let mut output = Vec::new();
    rpc::shell::run(
        &rig.sup,
        BufReader::new(&script[..]),
        &mut output,
        CancellationToken::new(),
    )
    .await
    .expect("shell");

    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("\"DEPENDENTS_RUNNING\""));
    assert!(text.contains("\"HALF\""));
    assert!(text.contains("\"width\": 160"));
    assert!(text.contains("error: "), "unknown ops are reported, not fatal");
    // Nothing after quit is executed
    assert_eq!(text.matches("DEPENDENTS_RUNNING").count(), 1);

    assert_eq!(
        rig.sup.get_keyword("DETGAIN").await.expect("keyword"),
        Some(camstack::keywords::KeywordValue::Int(42))
    );
    rig.sup.release().await;
}

#[tokio::test]
async fn test_tcp_clients_share_one_supervisor() {
    let rig = sim_rig();
    rig.sup.initialize(None, false).await.expect("initialize");

    let server = RpcServer::bind("127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr().expect("addr").to_string();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.run(rig.sup.clone(), cancel.clone()));

    let resp = rpc::call(&addr, "set_camera_mode", vec![json!("QUARTER")])
        .await
        .expect("call");
    assert!(resp.is_ok(), "{:?}", resp.error);

    let resp = rpc::call(&addr, "get_camera_mode", vec![]).await.expect("call");
    assert_eq!(resp.result["id"], json!("QUARTER"));

    let resp = rpc::call(&addr, "health", vec![]).await.expect("call");
    assert_eq!(resp.result["state"], json!("DEPENDENTS_RUNNING"));
    assert_eq!(resp.result["worker_running"], json!(true));

    let resp = rpc::call(&addr, "set_camera_mode", vec![json!("NOPE")])
        .await
        .expect("call");
    assert!(!resp.is_ok());
    assert_eq!(rig.sup.state().await, SupervisorState::DependentsRunning);

    // A window past the sensor's address range is an error, and the server keeps serving
    let resp = rpc::call(
        &addr,
        "set_camera_size",
        vec![json!(16), json!(16), json!(0), json!(4_294_967_290u32)],
    )
    .await
    .expect("call");
    assert!(!resp.is_ok());
    let resp = rpc::call(&addr, "get_camera_mode", vec![]).await.expect("call");
    assert_eq!(resp.result["id"], json!("QUARTER"));

    cancel.cancel();
    task.await.expect("join").expect("server");
    rig.sup.release().await;
}
