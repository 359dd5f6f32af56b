//! The listeners through which the enclave application, clients and other
//! enclaves talk to us

use std::future::Future;
use std::time::Duration;

use enclave::Enclave;
use eyre::WrapErr;
use serde::de::DeserializeOwned;
use shared::tee::Attester;
use shared::{ExternalMsg, FramedStream, InternalMsg, MsgError, ServerMsg};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::scheduler::{EventScheduler, InterruptFlag, NextEvent};

async fn bind(addr: &str, name: &str) -> eyre::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Could not bind the {name} listener to {addr}"))?;
    info!("Listening for {name} requests on {}", listener.local_addr()?);
    Ok(listener)
}

/// Answer framed requests on one connection until the peer hangs up or
/// stays silent for longer than `timeout`.
async fn serve_requests<Req, F, Fut>(stream: TcpStream, timeout: Duration, handle: F)
where
    Req: DeserializeOwned,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = ServerMsg>,
{
    let mut conn = FramedStream::new(stream);
    loop {
        let req = match tokio::time::timeout(timeout, conn.read::<Req>()).await {
            Err(_) => {
                debug!("Closing idle connection");
                return;
            }
            Ok(Err(MsgError::Closed)) => return,
            Ok(Err(e)) => {
                warn!("Could not read request: {e}");
                _ = conn.write(&ServerMsg::Error(e.to_string())).await;
                return;
            }
            Ok(Ok(req)) => req,
        };
        if let Err(e) = conn.write(&handle(req).await).await {
            warn!("Could not send reply: {e}");
            return;
        }
    }
}

/// Serve the enclave application. If we are a worker, this also drives the
/// synchronization with our leader.
pub async fn run_internal<A: Attester>(
    enclave: Enclave<A>,
    config: Config,
    interrupt: InterruptFlag,
) -> eyre::Result<()> {
    let listener = bind(&config.internal_addr, "internal").await?;
    let mut scheduler = EventScheduler::new(listener, interrupt);
    match (&config.leader, config.sync_interval()) {
        (Some(_), Some(interval)) => {
            scheduler = scheduler.with_ticks(tokio::time::interval(interval));
        }
        (Some(leader), None) => {
            let (enclave, leader) = (enclave.clone(), leader.clone());
            tokio::spawn(async move { enclave.request_keys(&leader).await });
        }
        _ => {}
    }

    loop {
        match scheduler.next_query().await {
            NextEvent::Interrupt => {
                info!("Shutting down the internal listener");
                return Ok(());
            }
            NextEvent::Accept(stream, peer) => {
                debug!("Enclave application connected from {peer}");
                let enclave = enclave.clone();
                let timeout = config.listen_timeout();
                tokio::spawn(async move {
                    serve_requests(stream, timeout, |msg: InternalMsg| {
                        enclave.handle_internal(msg)
                    })
                    .await
                });
            }
            NextEvent::AcceptFailed => {}
            NextEvent::Tick => {
                if let Some(leader) = &config.leader {
                    let (enclave, leader) = (enclave.clone(), leader.clone());
                    tokio::spawn(async move { enclave.request_keys(&leader).await });
                }
            }
        }
    }
}

/// Serve clients on the Internet. Unless configured otherwise, the listener
/// only comes up once the enclave application signalled readiness.
pub async fn run_external<A: Attester>(
    enclave: Enclave<A>,
    config: Config,
    interrupt: InterruptFlag,
) -> eyre::Result<()> {
    if config.wait_for_app {
        info!("Waiting for the enclave application to signal readiness");
        tokio::select! {
            _ = enclave.ready().wait() => {}
            _ = interrupt.interrupted() => return Ok(()),
        }
    }
    let listener = bind(&config.external_addr, "external").await?;
    let mut scheduler = EventScheduler::new(listener, interrupt);
    loop {
        match scheduler.next_query().await {
            NextEvent::Interrupt => {
                info!("Shutting down the external listener");
                return Ok(());
            }
            NextEvent::Accept(stream, peer) => {
                debug!("Client connected from {peer}");
                let enclave = enclave.clone();
                let timeout = config.listen_timeout();
                tokio::spawn(async move {
                    serve_requests(stream, timeout, |msg: ExternalMsg| {
                        enclave.handle_external(msg)
                    })
                    .await
                });
            }
            NextEvent::AcceptFailed | NextEvent::Tick => {}
        }
    }
}

/// Hand our key material to workers
pub async fn run_sync<A: Attester>(
    enclave: Enclave<A>,
    config: Config,
    interrupt: InterruptFlag,
) -> eyre::Result<()> {
    let listener = bind(&config.sync_addr, "key sync").await?;
    let mut scheduler = EventScheduler::new(listener, interrupt);
    loop {
        match scheduler.next_query().await {
            NextEvent::Interrupt => {
                info!("Shutting down the key sync listener");
                return Ok(());
            }
            NextEvent::Accept(stream, peer) => {
                info!("Worker {peer} requested our key material");
                let enclave = enclave.clone();
                tokio::spawn(async move { enclave.serve_key_sync(stream).await });
            }
            NextEvent::AcceptFailed | NextEvent::Tick => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use enclave::Settings;
    use shared::tee::transparent::TransparentAttester;

    use super::*;

    fn config() -> Config {
        Config {
            internal_addr: "127.0.0.1:0".to_string(),
            external_addr: "127.0.0.1:0".to_string(),
            sync_addr: "127.0.0.1:0".to_string(),
            listen_timeout_ms: 1_000,
            ..Config::default()
        }
    }

    async fn connect(listener: TcpListener) -> (FramedStream<TcpStream>, TcpStream) {
        let addr = listener.local_addr().expect("Test failed");
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = FramedStream::new(client.expect("Test failed"));
        (client, server.expect("Test failed").0)
    }

    #[tokio::test]
    async fn test_serve_requests() {
        let enclave = Enclave::new(TransparentAttester::default(), Settings::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
        let (mut client, server) = connect(listener).await;
        let served = {
            let enclave = enclave.clone();
            tokio::spawn(async move {
                serve_requests(server, Duration::from_secs(5), |msg: InternalMsg| {
                    enclave.handle_internal(msg)
                })
                .await
            })
        };

        client
            .write(&InternalMsg::PutState(vec![1, 2, 3]))
            .await
            .expect("Test failed");
        assert!(matches!(client.read::<ServerMsg>().await, Ok(ServerMsg::Success)));
        client.write(&InternalMsg::GetState).await.expect("Test failed");
        let Ok(ServerMsg::State(state)) = client.read::<ServerMsg>().await else {
            panic!("Test failed");
        };
        assert_eq!(state, vec![1, 2, 3]);

        drop(client);
        served.await.expect("Test failed");
    }

    #[tokio::test]
    async fn test_garbage_request_answered_with_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
        let (mut client, server) = connect(listener).await;
        let served = tokio::spawn(async move {
            serve_requests(server, Duration::from_secs(5), |_: InternalMsg| async {
                ServerMsg::Success
            })
            .await
        });
        // a well-formed frame holding the wrong message type
        client.write(&"hello").await.expect("Test failed");
        assert!(matches!(client.read::<ServerMsg>().await, Ok(ServerMsg::Error(_))));
        served.await.expect("Test failed");
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
        let (mut client, server) = connect(listener).await;
        let served = tokio::spawn(async move {
            serve_requests(server, Duration::from_millis(20), |_: InternalMsg| async {
                ServerMsg::Success
            })
            .await
        });
        served.await.expect("Test failed");
        assert!(matches!(
            client.read::<ServerMsg>().await,
            Err(MsgError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_external_listener_waits_for_readiness() {
        let enclave = Enclave::new(TransparentAttester::default(), Settings::default());
        let interrupt = InterruptFlag::new();
        let external = tokio::spawn(run_external(enclave.clone(), config(), interrupt.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!external.is_finished());
        // interrupting before readiness returns right away
        interrupt.interrupt();
        tokio::time::timeout(Duration::from_secs(5), external)
            .await
            .expect("Test failed")
            .expect("Test failed")
            .expect("Test failed");
    }

    #[tokio::test]
    async fn test_listeners_shut_down_on_interrupt() {
        let enclave = Enclave::new(TransparentAttester::default(), Settings::default());
        enclave.ready().set();
        let interrupt = InterruptFlag::new();
        let tasks = [
            tokio::spawn(run_internal(enclave.clone(), config(), interrupt.clone())),
            tokio::spawn(run_external(enclave.clone(), config(), interrupt.clone())),
            tokio::spawn(run_sync(enclave.clone(), config(), interrupt.clone())),
        ];
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.interrupt();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("Test failed")
                .expect("Test failed")
                .expect("Test failed");
        }
    }
}
