//! Shared-memory and descriptor payload scenarios.

use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};

use colloquy::{Client, Context, Object, Server, SharedMemory, pack_args};

const BLOCK_SIZE: usize = 1024 * 1024;

fn exchange_blob_context() -> Context {
    let context = Context::new();
    context
        .register_func(None, None, "exchange_blob", |_cx, args| {
            let blob = args.get_index(0).unwrap();
            let mut mapping = blob.shmem_map()?;

            assert!(mapping.as_slice().iter().all(|b| *b == b'A'));
            mapping.as_mut_slice().fill(b'B');
            Ok(Object::null())
        })
        .unwrap();
    context
}

#[tokio::test]
async fn shmem_round_trip_loopback() {
    let server = Server::listen("loopback://shmem", exchange_blob_context())
        .await
        .unwrap();
    server.resume();
    let client = Client::connect("loopback://shmem", None).await.unwrap();

    let block = SharedMemory::alloc(BLOCK_SIZE).unwrap();
    let mut mapping = block.map().unwrap();
    mapping.as_mut_slice().fill(b'A');

    client
        .connection()
        .call_simple("exchange_blob", Some("[v]"), pack_args![Object::shmem(&block)])
        .await
        .unwrap();

    // The server wrote into the same pages this mapping covers.
    assert!(mapping.as_slice().iter().all(|b| *b == b'B'));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn shmem_round_trip_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("unix://{}", dir.path().join("shmem.sock").display());

    let server = Server::listen(&uri, exchange_blob_context()).await.unwrap();
    server.resume();
    let client = Client::connect(&uri, None).await.unwrap();

    let block = SharedMemory::alloc(BLOCK_SIZE).unwrap();
    let mut mapping = block.map().unwrap();
    mapping.as_mut_slice().fill(b'A');

    client
        .connection()
        .call_simple("exchange_blob", Some("[v]"), pack_args![Object::shmem(&block)])
        .await
        .unwrap();

    assert!(mapping.as_slice().iter().all(|b| *b == b'B'));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn fd_payload_writes_into_a_pipe() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let uri = format!("unix://{}", dir.path().join("fd.sock").display());

    let context = Context::new();
    context
        .register_func(None, None, "write_to_pipe", |_cx, args| {
            let fd = args.get_index(0).unwrap().fd_raw()?;

            // Write through a duplicate; the received descriptor closes with
            // the argument object.
            let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
            assert!(duped >= 0);
            let mut file = unsafe { std::fs::File::from_raw_fd(duped) };
            file.write_all(b"Hello there\nBye.\n").unwrap();
            Ok(Object::null())
        })
        .unwrap();

    let server = Server::listen(&uri, context).await.unwrap();
    server.resume();
    let client = Client::connect(&uri, None).await.unwrap();

    let mut pipe_fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    let read_end = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(pipe_fds[1]) };

    client
        .connection()
        .call_simple(
            "write_to_pipe",
            Some("[v]"),
            pack_args![Object::fd_owned(write_end)],
        )
        .await
        .unwrap();

    // Every copy of the write end is closed once the call retires, so the
    // read drains to EOF.
    let mut contents = String::new();
    std::fs::File::from(read_end)
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "Hello there\nBye.\n");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn shmem_geometry_survives_the_wire() {
    let context = Context::new();
    context
        .register_func(None, None, "inspect", |_cx, args| {
            let blob = args.get_index(0).unwrap();
            Ok(Object::uint64(blob.shmem_size()? as u64))
        })
        .unwrap();

    let server = Server::listen("loopback://shmem-geometry", context)
        .await
        .unwrap();
    server.resume();
    let client = Client::connect("loopback://shmem-geometry", None)
        .await
        .unwrap();

    let block = SharedMemory::alloc(BLOCK_SIZE).unwrap();
    let size = client
        .connection()
        .call_simple("inspect", Some("[v]"), pack_args![Object::shmem(&block)])
        .await
        .unwrap();
    assert_eq!(size.as_u64().unwrap(), BLOCK_SIZE as u64);

    client.close().await;
    server.close().await;
}
