//! Streaming call scenarios: prefetch, ordering, abort, timeouts.

use std::sync::Arc;
use std::time::Duration;

use colloquy::{CallStatus, Client, Context, Object, Server, UnpackSlot, pack_args};

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

async fn serve(id: &str, context: Context) -> (Server, Client) {
    let uri = format!("loopback://{}", id);
    let server = Server::listen(&uri, context).await.unwrap();
    server.resume();
    let client = Client::connect(&uri, None).await.unwrap();
    (server, client)
}

#[tokio::test]
async fn streaming_letters_consumes_every_fragment() {
    let setcnt: i64 = 137;

    let context = Context::new();
    context
        .register_async(None, None, "stream", move |cx, _args| async move {
            let mut cnt: i64 = 0;
            while cnt < setcnt {
                cnt += 1;
                let i = ((cnt * 7) % 26) as usize;
                let fragment = Object::pack(
                    "[s,i,i]",
                    pack_args![&ALPHABET[i..], 26 - i as i64, cnt],
                )?;
                if cx.yield_(fragment).await.is_err() {
                    cx.end().await?;
                    return Ok(Object::null());
                }
            }
            Ok(Object::null())
        })
        .unwrap();

    let (server, client) = serve("letters", context).await;

    let call = client
        .connection()
        .call(None, None, "stream", Object::array(Vec::new()))
        .await
        .unwrap();
    call.set_prefetch(10).await.unwrap();

    let mut consumed: i64 = 0;
    loop {
        match call.wait().await {
            CallStatus::StreamStart => {
                call.continue_(false).await.unwrap();
            }
            CallStatus::MoreAvailable => {
                let fragment = call.result().unwrap();

                let mut tail = String::new();
                let mut len = 0i64;
                let mut num = 0i64;
                let count = fragment.unpack(
                    "[s,i,i]",
                    &mut [
                        UnpackSlot::Str(&mut tail),
                        UnpackSlot::Int(&mut len),
                        UnpackSlot::Int(&mut num),
                    ],
                );
                assert_eq!(count, 3);
                assert_eq!(len as usize, tail.len());

                consumed += 1;
                assert_eq!(num, consumed);

                call.continue_(false).await.unwrap();
            }
            CallStatus::Ended => break,
            other => panic!("unexpected status {:?}", other),
        }
    }

    assert_eq!(consumed, setcnt);
    assert_eq!(call.status(), CallStatus::Ended);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn fragments_arrive_in_yield_order() {
    let context = Context::new();
    context
        .register_async(None, None, "count", |cx, _args| async move {
            for n in 0..50i64 {
                cx.yield_(Object::int64(n)).await?;
            }
            Ok(Object::null())
        })
        .unwrap();

    let (server, client) = serve("ordering", context).await;

    let call = client
        .connection()
        .call(None, None, "count", Object::array(Vec::new()))
        .await
        .unwrap();
    call.set_prefetch(5).await.unwrap();

    let mut seen = Vec::new();
    loop {
        match call.wait().await {
            CallStatus::StreamStart => call.continue_(false).await.unwrap(),
            CallStatus::MoreAvailable => {
                seen.push(call.result().unwrap().as_i64().unwrap());
                call.continue_(false).await.unwrap();
            }
            CallStatus::Ended => break,
            other => panic!("unexpected status {:?}", other),
        }
    }

    let expected: Vec<i64> = (0..50).collect();
    assert_eq!(seen, expected);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn abort_unblocks_the_handler() {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

    let context = Context::new();
    let handler_tx = tx.clone();
    context
        .register_async(None, None, "endless", move |cx, _args| {
            let handler_tx = handler_tx.clone();
            async move {
                let mut n: i64 = 0;
                loop {
                    n += 1;
                    if cx.yield_(Object::int64(n)).await.is_err() {
                        // Yield failed: the peer aborted; unwind.
                        if let Some(tx) = handler_tx.lock().take() {
                            let _ = tx.send(());
                        }
                        return Ok(Object::null());
                    }
                }
            }
        })
        .unwrap();

    let (server, client) = serve("abort", context).await;

    let call = client
        .connection()
        .call(None, None, "endless", Object::array(Vec::new()))
        .await
        .unwrap();

    // Consume a couple of fragments, then drop the call.
    call.wait().await;
    call.continue_(false).await.unwrap();
    call.wait().await;
    call.abort().await.unwrap();
    assert_eq!(call.status(), CallStatus::Aborted);

    // The handler's next yield must fail within bounded time.
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("handler did not observe the abort")
        .unwrap();

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn wait_deadline_leaves_the_call_live() {
    let context = Context::new();
    context
        .register_async(None, None, "slow", |_cx, _args| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Object::string("late"))
        })
        .unwrap();

    let (server, client) = serve("timeout", context).await;

    let call = client
        .connection()
        .call(None, None, "slow", Object::array(Vec::new()))
        .await
        .unwrap();

    let err = call
        .wait_deadline(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), colloquy::ErrorKind::Timeout);
    // The call is still in flight.
    assert_eq!(call.status(), CallStatus::InProgress);

    call.abort().await.unwrap();
    assert_eq!(call.status(), CallStatus::Aborted);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn prefetch_caps_how_far_the_handler_runs_ahead() {
    use std::sync::atomic::{AtomicI64, Ordering};

    let attempted = Arc::new(AtomicI64::new(0));

    let context = Context::new();
    let handler_attempted = attempted.clone();
    context
        .register_async(None, None, "burst", move |cx, _args| {
            let attempted = handler_attempted.clone();
            async move {
                for n in 0..100i64 {
                    attempted.fetch_add(1, Ordering::SeqCst);
                    if cx.yield_(Object::int64(n)).await.is_err() {
                        return Ok(Object::null());
                    }
                }
                Ok(Object::null())
            }
        })
        .unwrap();

    let (server, client) = serve("prefetch", context).await;

    let call = client
        .connection()
        .call(None, None, "burst", Object::array(Vec::new()))
        .await
        .unwrap();
    call.set_prefetch(3).await.unwrap();

    // Give the server ample time to push as far as its credit allows.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The client granted 3 credits and consumed nothing, so the handler has
    // sent at most 3 fragments and is blocked inside one further yield.
    let ahead = attempted.load(Ordering::SeqCst);
    assert!(ahead >= 1);
    assert!(ahead <= 4, "handler ran {} yields ahead", ahead);

    call.abort().await.unwrap();
    client.close().await;
    server.close().await;
}
