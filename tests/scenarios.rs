//! End-to-end scenario tests driving Pool + health pass + forwarder
//! together against `FakeRuntime`, without a real container runtime or
//! network, so these run in CI without Docker installed. The forwarder's
//! network-facing scenarios (S2's connect-failure retry, S6's read-timeout)
//! use `NetRuntime` below, a `RuntimeAdapter` that binds real local TCP
//! listeners instead of talking to Docker, so the actual retry and
//! timeout-classification code in `forwarder.rs` runs end to end.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use corral::config::Config;
    use corral::error::RuntimeError;
    use corral::forwarder::{router, AppState};
    use corral::health::run_pass;
    use corral::pool::Pool;
    use corral::runtime::{FakeRuntime, MemorySample, RuntimeAdapter, RuntimeResult};

    fn config() -> Config {
        Config {
            image_name: "img".into(),
            memory_limit: "280m".into(),
            server_port: 5000,
            lb_port_start: 9000,
            fast_api_port: 8000,
            initial_node_count: 1,
            health_check_time_secs: 10,
            min_nodes: 1,
            max_nodes: 10,
            max_memory_usage_threshold: 70.0,
            min_memory_usage_threshold: 20.0,
            scale_up_node_count: 1,
            scale_down_node_count: 1,
        }
    }

    /// S1: happy path. A single Node comes up; after one health pass it is
    /// published as the scheduled node.
    #[tokio::test]
    async fn s1_happy_path_publishes_the_only_node() {
        let runtime = FakeRuntime::new();
        let pool = Pool::new(runtime.clone(), "img".into(), "280m".into(), 5000, 9000);
        let mut cfg = config();
        cfg.initial_node_count = 1;

        pool.add(cfg.initial_node_count).await.unwrap();
        assert!(pool.get_scheduled().is_none(), "null before first health pass");

        let ids: Vec<String> = pool.snapshot().iter().map(|n| n.container_id.clone()).collect();
        runtime.set_all_used_pct(&ids, 10.0);
        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        let scheduled = pool.get_scheduled().expect("scheduled node after first pass");
        assert_eq!(scheduled.container_id, ids[0]);
    }

    /// S2: failure recovery. One of two Nodes is externally killed; the
    /// next health pass repairs the pool back to its original size and
    /// the forwarder no longer targets the dead Node.
    #[tokio::test]
    async fn s2_failure_recovery_restores_pool_size() {
        let runtime = FakeRuntime::new();
        let pool = Arc::new(Pool::new(runtime.clone(), "img".into(), "280m".into(), 5000, 9000));
        let cfg = config();

        pool.add(2).await.unwrap();
        let ids: Vec<String> = pool.snapshot().iter().map(|n| n.container_id.clone()).collect();
        runtime.set_all_used_pct(&ids, 30.0);
        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        let scheduled = pool.get_scheduled().unwrap();
        runtime.kill(&scheduled.container_id);

        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        assert_eq!(pool.get_count(), 2);
        assert!(pool
            .snapshot()
            .iter()
            .all(|n| n.container_id != scheduled.container_id));
    }

    /// S3: scale-up. Both Nodes in a pool of 2 breach the high threshold
    /// for one pass; the pool grows by `SCALE_UP_NODE_COUNT`.
    #[tokio::test]
    async fn s3_scale_up_grows_pool() {
        let runtime = FakeRuntime::new();
        let pool = Pool::new(runtime.clone(), "img".into(), "280m".into(), 5000, 9000);
        let mut cfg = config();
        cfg.scale_up_node_count = 2;
        cfg.max_nodes = 10;

        pool.add(2).await.unwrap();
        let ids: Vec<String> = pool.snapshot().iter().map(|n| n.container_id.clone()).collect();
        runtime.set_all_used_pct(&ids, 80.0);

        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        assert_eq!(pool.get_count(), 4);
    }

    /// S4: scale-up cap. MAX_NODES=10, SCALE_UP_NODE_COUNT=2, pool at 8,
    /// all over threshold: the pass refuses the add since 8+2 >= 10.
    #[tokio::test]
    async fn s4_scale_up_refused_at_cap() {
        let runtime = FakeRuntime::new();
        let pool = Pool::new(runtime.clone(), "img".into(), "280m".into(), 5000, 9000);
        let mut cfg = config();
        cfg.max_nodes = 10;
        cfg.scale_up_node_count = 2;

        pool.add(8).await.unwrap();
        let ids: Vec<String> = pool.snapshot().iter().map(|n| n.container_id.clone()).collect();
        runtime.set_all_used_pct(&ids, 90.0);

        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        assert_eq!(pool.get_count(), 8);
    }

    /// S5: scale-down floor. MIN_NODES=1, pool at 1, utilization 5%:
    /// scale-down is refused, pool stays at 1.
    #[tokio::test]
    async fn s5_scale_down_refused_at_floor() {
        let runtime = FakeRuntime::new();
        let pool = Pool::new(runtime.clone(), "img".into(), "280m".into(), 5000, 9000);
        let mut cfg = config();
        cfg.min_nodes = 1;

        pool.add(1).await.unwrap();
        let ids: Vec<String> = pool.snapshot().iter().map(|n| n.container_id.clone()).collect();
        runtime.set_all_used_pct(&ids, 5.0);

        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        assert_eq!(pool.get_count(), 1);
    }

    /// A `RuntimeAdapter` that binds real local TCP listeners rather than
    /// talking to a container runtime. `dead_ports` get no listener at all
    /// (a connect attempt there is refused, simulating a dead container);
    /// `stall_ports` get a listener that accepts and then never writes a
    /// response (simulating a worker that's alive but stuck); every other
    /// port gets a listener that answers with a literal `alive-<port>` body.
    #[derive(Debug)]
    struct NetRuntime {
        dead_ports: HashSet<u16>,
        stall_ports: HashSet<u16>,
        next_id: AtomicU64,
    }

    impl NetRuntime {
        fn new(dead_ports: HashSet<u16>, stall_ports: HashSet<u16>) -> Arc<Self> {
            Arc::new(Self {
                dead_ports,
                stall_ports,
                next_id: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl RuntimeAdapter for NetRuntime {
        async fn start(
            &self,
            _image: &str,
            _memory_limit: &str,
            _container_port: u16,
            host_port: u16,
        ) -> RuntimeResult<String> {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = format!("{n:08x}net{host_port}");

            if self.dead_ports.contains(&host_port) {
                return Ok(id);
            }

            let listener = TcpListener::bind(("127.0.0.1", host_port))
                .await
                .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;
            let stall = self.stall_ports.contains(&host_port);

            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(serve_one(socket, host_port, stall));
                }
            });

            Ok(id)
        }

        async fn stop_and_remove(&self, _container_id: &str) {}

        async fn sample(&self, _container_id: &str) -> RuntimeResult<MemorySample> {
            Err(RuntimeError::MissingStats)
        }
    }

    async fn serve_one(mut socket: tokio::net::TcpStream, host_port: u16, stall: bool) {
        if stall {
            // Hold the connection open and never write — the client's read
            // timeout, not this task, ends the exchange.
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }
        let body = format!("alive-{host_port}");
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = socket.write_all(response.as_bytes()).await;
    }

    /// Binds corral's own HTTP surface on an ephemeral port and serves it in
    /// the background, returning the address a test client can hit.
    async fn spawn_corral(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    /// S2 at the forwarder layer (P5): the scheduled Node is dead. The
    /// connect failure must drive `replace_failed`, republish a surviving
    /// Node as scheduled, and the single retry must reach it — all within
    /// one client request, with no second client-visible failure.
    #[tokio::test]
    async fn s2_forwarder_retries_past_dead_scheduled_node() {
        let dead_port = 19_500;
        let alive_port = 19_501;
        let runtime = NetRuntime::new(HashSet::from([dead_port]), HashSet::new());
        let pool = Arc::new(Pool::new(
            runtime.clone(),
            "img".into(),
            "140m".into(),
            5000,
            dead_port,
        ));
        pool.add(2).await.unwrap();
        let dead_node = pool
            .snapshot()
            .into_iter()
            .find(|n| n.host_port == dead_port)
            .unwrap();
        pool.set_scheduled(Some(dead_node.clone()));

        let state = AppState::new(pool.clone(), runtime.clone());
        let addr = spawn_corral(state).await;

        let response = reqwest::get(format!("http://{addr}/api")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), format!("alive-{alive_port}"));

        // The retry's repair ran: count is back to 2, and the dead Node's
        // port is gone from both the live set and the published target.
        assert_eq!(pool.get_count(), 2);
        assert!(pool.snapshot().iter().all(|n| n.host_port != dead_port));
        assert_eq!(pool.get_scheduled().unwrap().host_port, alive_port);
    }

    /// S6: read-timeout. The scheduled Node accepts the connection but never
    /// responds; the client must see the literal "ReadTimeout" body and the
    /// pool must be untouched — no replacement, no scheduled-node change.
    #[tokio::test]
    async fn s6_read_timeout_returns_literal_and_leaves_pool_untouched() {
        let stall_port = 19_600;
        let runtime = NetRuntime::new(HashSet::new(), HashSet::from([stall_port]));
        let pool = Arc::new(Pool::new(
            runtime.clone(),
            "img".into(),
            "140m".into(),
            5000,
            stall_port,
        ));
        pool.add(1).await.unwrap();
        let node = pool.snapshot().into_iter().next().unwrap();
        pool.set_scheduled(Some(node.clone()));

        let state = AppState::with_timeouts(
            pool.clone(),
            runtime.clone(),
            Duration::from_secs(2),
            Duration::from_millis(200),
        );
        let addr = spawn_corral(state).await;

        let response = reqwest::get(format!("http://{addr}/api")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ReadTimeout");

        assert_eq!(pool.get_count(), 1);
        assert_eq!(pool.get_scheduled().unwrap().host_port, stall_port);
    }

    /// P3: scheduled_node is always the minimum of the last active set.
    #[tokio::test]
    async fn p3_scheduled_node_is_minimum_of_active_set() {
        let runtime = FakeRuntime::new();
        let pool = Pool::new(runtime.clone(), "img".into(), "280m".into(), 5000, 9000);
        let cfg = config();

        pool.add(3).await.unwrap();
        let ids: Vec<String> = pool.snapshot().iter().map(|n| n.container_id.clone()).collect();
        for (i, id) in ids.iter().enumerate() {
            runtime.set_sample(
                id,
                Some(MemorySample {
                    used_bytes: (i as u64 + 1) * 1_000,
                    limit_bytes: 1_000_000,
                }),
            );
        }

        run_pass(&pool, runtime.as_ref(), &cfg).await.unwrap();

        let scheduled = pool.get_scheduled().unwrap();
        assert_eq!(scheduled.container_id, ids[0]);
        let min_pct = scheduled.memory_used_pct.unwrap();
        for node in pool.snapshot() {
            assert!(min_pct <= node.memory_used_pct.unwrap());
        }
    }
}
