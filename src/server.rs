use anyhow::{Context, Result};
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::proxy::{Proxy, handle_connection};

pub async fn bind(config: &Config) -> Result<TcpListener> {
    let addr = config.listen_addr();
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))
}

/// Accepts connections until `shutdown` resolves, one task per connection.
///
/// Handlers already running when `shutdown` fires are left to finish on
/// their own.
pub async fn serve<F>(listener: TcpListener, proxy: Arc<Proxy>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local_addr = listener
        .local_addr()
        .context("Failed to get listener local address")?;
    info!(
        listen_addr = %local_addr,
        target_host = %proxy.config().target_host,
        target_ports = ?proxy.selector().ports(),
        "Proxy server listening"
    );

    tokio::pin!(shutdown);

    loop {
        let (stream, client_addr) = tokio::select! {
            () = &mut shutdown => {
                info!("Shutting down, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client connection");
                    continue;
                }
            },
        };

        info!(client_addr = %client_addr, "Accepted connection");
        let proxy = Arc::clone(&proxy);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, &proxy).await {
                error!(client_addr = %client_addr, error = %format!("{e:#}"), "Connection failed");
            }
        });
    }

    Ok(())
}

/// Binds the configured address and serves until `shutdown` resolves.
pub async fn run<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let proxy = Arc::new(Proxy::new(config)?);
    let listener = bind(proxy.config()).await?;
    serve(listener, proxy, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::{
        TEST_TIMEOUT, find_free_port, start_echo_backend, start_replying_backend, test_proxy,
    };
    use futures_util::{SinkExt, StreamExt};
    use std::{collections::HashMap, net::SocketAddr};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
        task::JoinHandle,
        time::timeout,
    };
    use tokio_test::{assert_err, assert_ok};
    use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    struct RunningProxy {
        addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<Result<()>>,
    }

    async fn start_proxy(proxy: Arc<Proxy>) -> RunningProxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, proxy, async move {
            let _ = shutdown_rx.await;
        }));
        RunningProxy {
            addr,
            shutdown,
            task,
        }
    }

    async fn request(addr: SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(REQUEST).await.unwrap();
        let mut response = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    /// Starts a tungstenite server that echoes every data frame back.
    async fn start_websocket_echo_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(ws_stream) = accept_async(stream).await else {
                        return;
                    };
                    let (mut sender, mut receiver) = ws_stream.split();
                    while let Some(Ok(msg)) = receiver.next().await {
                        if (msg.is_binary() || msg.is_text()) && sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        port
    }

    mod routing {
        use super::*;

        #[tokio::test]
        async fn cycles_through_backends_in_order() {
            let mut ports = Vec::new();
            for tag in ["a", "b", "c"] {
                let (port, _) = start_replying_backend(tag.as_bytes().to_vec()).await;
                ports.push(port);
            }
            let running = start_proxy(test_proxy(ports, 4096)).await;

            let mut responses = Vec::new();
            for _ in 0..6 {
                responses.push(String::from_utf8(request(running.addr).await).unwrap());
            }
            assert_eq!(responses, ["a", "b", "c", "a", "b", "c"]);
        }

        #[tokio::test]
        async fn concurrent_clients_share_backends_evenly() {
            let (first, _) = start_replying_backend(b"first".to_vec()).await;
            let (second, _) = start_replying_backend(b"second".to_vec()).await;
            let running = start_proxy(test_proxy(vec![first, second], 4096)).await;

            let tasks: Vec<_> = (0..10)
                .map(|_| tokio::spawn(request(running.addr)))
                .collect();

            let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
            for task in tasks {
                *counts.entry(task.await.unwrap()).or_default() += 1;
            }
            assert_eq!(counts[b"first".as_slice()], 5);
            assert_eq!(counts[b"second".as_slice()], 5);
        }

        #[tokio::test]
        async fn dead_backend_keeps_its_turn() {
            let dead_port = find_free_port().await;
            let (live_port, _) = start_replying_backend(b"ok".to_vec()).await;
            let running = start_proxy(test_proxy(vec![live_port, dead_port], 4096)).await;

            assert_eq!(request(running.addr).await, b"ok");
            assert!(request(running.addr).await.is_empty());
            assert_eq!(request(running.addr).await, b"ok");
        }
    }

    mod websocket {
        use super::*;

        #[tokio::test]
        async fn handshake_and_frames_pass_through() {
            let backend_port = start_websocket_echo_backend().await;
            let running = start_proxy(test_proxy(vec![backend_port], 4096)).await;

            let url = format!("ws://{}/chat", running.addr);
            let (ws_stream, _) = timeout(TEST_TIMEOUT, connect_async(&url))
                .await
                .unwrap()
                .unwrap();
            let (mut sender, mut receiver) = ws_stream.split();

            let binary = vec![0xAB; 10_000];
            sender
                .send(Message::Binary(binary.clone().into()))
                .await
                .unwrap();
            let echoed = timeout(TEST_TIMEOUT, receiver.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(echoed, Message::Binary(binary.into()));

            sender.send(Message::Text("hello".to_string().into())).await.unwrap();
            let echoed = timeout(TEST_TIMEOUT, receiver.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(echoed, Message::Text("hello".to_string().into()));
        }
    }

    mod accept_loop {
        use super::*;

        #[tokio::test]
        async fn silent_client_does_not_block_others() {
            let port = start_echo_backend().await;
            let running = start_proxy(test_proxy(vec![port], 4096)).await;

            let _silent = TcpStream::connect(running.addr).await.unwrap();

            let mut client = TcpStream::connect(running.addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut echoed = [0u8; 4];
            timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&echoed, b"ping");
        }

        #[tokio::test]
        async fn empty_connection_does_not_consume_a_turn() {
            let (first, _) = start_replying_backend(b"first".to_vec()).await;
            let (second, _) = start_replying_backend(b"second".to_vec()).await;
            let running = start_proxy(test_proxy(vec![first, second], 4096)).await;

            drop(TcpStream::connect(running.addr).await.unwrap());
            assert_eq!(request(running.addr).await, b"first");
        }

        #[tokio::test]
        async fn shutdown_stops_accepting() {
            let port = start_echo_backend().await;
            let running = start_proxy(test_proxy(vec![port], 4096)).await;

            running.shutdown.send(()).unwrap();
            let result = timeout(TEST_TIMEOUT, running.task).await.unwrap().unwrap();
            assert_ok!(result);

            assert_err!(TcpStream::connect(running.addr).await);
        }

        #[tokio::test]
        async fn bind_fails_when_address_in_use() {
            let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let config = Config {
                port: taken.local_addr().unwrap().port(),
                ..Config::default()
            };

            let err = bind(&config).await.unwrap_err();
            assert!(format!("{err:#}").contains("Failed to bind to address"));

            let err = run(config, std::future::pending()).await.unwrap_err();
            assert!(format!("{err:#}").contains("Failed to bind to address"));
        }

        #[tokio::test]
        async fn run_rejects_invalid_config() {
            let config = Config {
                buffer_size: 0,
                ..Config::default()
            };
            assert_err!(run(config, std::future::pending()).await);
        }
    }
}
