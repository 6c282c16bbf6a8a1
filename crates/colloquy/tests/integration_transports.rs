//! The same call surface across every stream transport.

use colloquy::{Client, Context, ErrorKind, Object, Server, pack_args};

fn hello_context() -> Context {
    let context = Context::new();
    context
        .register_func(None, None, "hello", |_cx, args| {
            let name = args.get_index(0).unwrap().as_str()?.to_owned();
            Ok(Object::string(format!("hello {}!", name)))
        })
        .unwrap();
    context
}

async fn hello_roundtrip(server: Server) {
    let client = Client::connect(server.local_uri(), None).await.unwrap();

    let result = client
        .connection()
        .call_simple("hello", Some("[s]"), pack_args!["world"])
        .await
        .unwrap();
    assert_eq!(result.as_str().unwrap(), "hello world!");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn hello_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("unix://{}", dir.path().join("hello.sock").display());
    let server = Server::listen(&uri, hello_context()).await.unwrap();
    server.resume();
    hello_roundtrip(server).await;
}

#[tokio::test]
async fn hello_over_tcp() {
    let server = Server::listen("tcp://127.0.0.1:0", hello_context())
        .await
        .unwrap();
    server.resume();
    hello_roundtrip(server).await;
}

#[tokio::test]
async fn hello_over_websocket() {
    let server = Server::listen("ws://127.0.0.1:0", hello_context())
        .await
        .unwrap();
    server.resume();
    hello_roundtrip(server).await;
}

#[tokio::test]
async fn descriptors_degrade_on_tcp() {
    let server = Server::listen("tcp://127.0.0.1:0", hello_context())
        .await
        .unwrap();
    server.resume();
    let client = Client::connect(server.local_uri(), None).await.unwrap();

    let pipe_read = unsafe { libc::dup(0) };
    let err = client
        .connection()
        .call(
            None,
            None,
            "hello",
            Object::array(vec![Object::fd(pipe_read, true)]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedByTransport);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unix_transport_reports_peer_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("unix://{}", dir.path().join("cred.sock").display());

    let context = Context::new();
    context
        .register_func(None, None, "whoami", |cx, _args| {
            let cred = cx
                .peer_cred()
                .ok_or_else(|| colloquy::RpcError::internal("no peer credentials"))?;
            Ok(Object::uint64(u64::from(cred.uid)))
        })
        .unwrap();

    let server = Server::listen(&uri, context).await.unwrap();
    server.resume();
    let client = Client::connect(&uri, None).await.unwrap();

    let uid = client
        .connection()
        .call_simple("whoami", None, pack_args![])
        .await
        .unwrap();
    let own_uid = unsafe { libc::getuid() };
    assert_eq!(uid.as_u64().unwrap(), u64::from(own_uid));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn server_event_handler_sees_connects() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let server = Server::listen("tcp://127.0.0.1:0", hello_context())
        .await
        .unwrap();
    server.resume();

    let connects = Arc::new(AtomicUsize::new(0));
    let seen = connects.clone();
    server.set_event_handler(Arc::new(move |_conn, event| {
        if event == colloquy::ServerEvent::Connect {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let client = Client::connect(server.local_uri(), None).await.unwrap();
    // Drive one call so the accept has certainly completed.
    client
        .connection()
        .call_simple("hello", Some("[s]"), pack_args!["x"])
        .await
        .unwrap();

    assert_eq!(connects.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
}
