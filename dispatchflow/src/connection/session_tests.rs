//! Scenario tests for the interactive session.

#[cfg(test)]
mod tests {
    use crate::connection::{listen_feedback_all, Connection, SharedConnection, ShellSession};
    use crate::errors::FailureKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;

    /// Returns a session and the device end of its transport.
    fn session(name: &str) -> (ShellSession, DuplexStream) {
        let (device, host) = tokio::io::duplex(8192);
        let (reader, writer) = tokio::io::split(host);
        (ShellSession::from_transport(name, reader, writer), device)
    }

    async fn read_available(device: &mut DuplexStream) -> String {
        let mut buf = vec![0_u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(1), device.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_wait_matches_prompt() {
        let (session, mut device) = session("console");
        let session = session.with_prompts(vec![r"root@\w+:~# ".to_string()]);

        device.write_all(b"Welcome\nroot@board:~# ").await.unwrap();
        let index = session
            .wait(Some(Instant::now() + Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(index, 0);
        assert_eq!(session.before(), "Welcome\n");
    }

    #[tokio::test]
    async fn test_wait_returns_index_of_earliest_alternative() {
        let (session, mut device) = session("console");
        session.set_prompt_str(vec!["login:".to_string(), "Password:".to_string()]);

        device.write_all(b"noise Password: then login:").await.unwrap();
        let index = session.wait(None).await.unwrap();
        assert_eq!(index, 1);

        // The rest of the buffer is still there for the next wait.
        let index = session.wait(None).await.unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn test_wait_prompt_split_across_chunks() {
        let (session, mut device) = session("console");
        let session = session.with_prompts(vec!["=> ".to_string()]);

        let writer = tokio::spawn(async move {
            device.write_all(b"U-Boot 2024.01\n=").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            device.write_all(b"> ").await.unwrap();
            device
        });

        assert_eq!(session.wait(None).await.unwrap(), 0);
        drop(writer.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_is_typed() {
        let (session, _device) = session("console");
        let session = session.with_prompts(vec!["# ".to_string()]);

        let err = session
            .wait(Some(Instant::now() + Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_wait_on_closed_stream_is_infrastructure() {
        let (session, device) = session("console");
        let session = session.with_prompts(vec!["# ".to_string()]);
        drop(device);

        let err = session.wait(None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Infrastructure);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_wait_without_prompt_is_bug() {
        let (session, _device) = session("console");
        let err = session.wait(None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::EngineBug);
    }

    #[tokio::test]
    async fn test_invalid_prompt_is_test_failure() {
        let (session, _device) = session("console");
        session.set_prompt_str(vec!["(unclosed".to_string()]);
        let err = session.wait(None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Test);
    }

    #[tokio::test]
    async fn test_sendline_appends_separator() {
        let (session, mut device) = session("console");
        session.sendline("uname -a", 0).await.unwrap();
        assert_eq!(read_available(&mut device).await, "uname -a\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sendline_with_character_delay() {
        let (session, mut device) = session("console");
        let started = Instant::now();
        session.sendline("boot", 100).await.unwrap();

        // Five characters including the separator, each followed by a pause.
        assert!(started.elapsed() >= Duration::from_millis(500));
        let mut buf = vec![0_u8; 16];
        let mut received = String::new();
        while received.len() < 5 {
            let n = device.read(&mut buf).await.unwrap();
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert_eq!(received, "boot\n");
    }

    #[tokio::test]
    async fn test_sendcontrol() {
        let (session, mut device) = session("console");
        session.sendcontrol('c').await.unwrap();
        assert_eq!(read_available(&mut device).await, "\u{3}");
        assert_eq!(
            session.sendcontrol('1').await.unwrap_err().kind(),
            FailureKind::EngineBug
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_prompt_wait_probes_then_matches() {
        let (session, mut device) = session("console");
        let session = session.with_prompts(vec!["# $".to_string()]);

        // The device only answers with a clean prompt once probed.
        let responder = tokio::spawn(async move {
            let mut buf = vec![0_u8; 64];
            let n = device.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"#\n");
            device.write_all(b"\n# ").await.unwrap();
            device
        });

        let index = session.force_prompt_wait(Duration::from_secs(10)).await.unwrap();
        assert_eq!(index, 0);
        drop(responder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_prompt_wait_bounded_budget() {
        let (session, _device) = session("console");
        let session = session.with_prompts(vec!["never-matches".to_string()]);

        let started = Instant::now();
        let err = session
            .force_prompt_wait(Duration::from_secs(10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Timeout);
        // Half the budget, then six probes of a tenth each.
        let spent = started.elapsed();
        assert!(spent >= Duration::from_secs(11), "{spent:?}");
        assert!(spent < Duration::from_secs(12), "{spent:?}");
    }

    #[tokio::test]
    async fn test_listen_feedback_counts_bytes() {
        let (session, mut device) = session("guest");
        device.write_all(b"guest booted\n").await.unwrap();

        let read = session
            .listen_feedback(Duration::from_millis(500), Some("guest"))
            .await
            .unwrap();
        assert_eq!(read, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_feedback_quiet_connection() {
        let (session, _device) = session("guest");
        let read = session
            .listen_feedback(Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_listen_feedback_rejects_zero_window() {
        let (session, _device) = session("guest");
        let err = session.listen_feedback(Duration::ZERO, None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::EngineBug);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_feedback_all_shares_one_window() {
        let mut devices = Vec::new();
        let mut connections: Vec<(String, SharedConnection)> = Vec::new();
        for ns in ["a", "b", "c", "d"] {
            let (session, device) = session(ns);
            devices.push(device);
            connections.push((ns.to_string(), Arc::new(session)));
        }
        devices[1].write_all(b"hello from b\n").await.unwrap();

        let started = Instant::now();
        let results = listen_feedback_all(&connections, Duration::from_secs(1)).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 4);
        let b = results.iter().find(|(ns, _)| ns == "b").unwrap();
        assert_eq!(*b.1.as_ref().unwrap(), 13);
    }

    #[tokio::test]
    async fn test_finalise_is_idempotent() {
        let (session, _device) = session("console");
        session.finalise().await;
        assert!(!session.is_connected());
        session.finalise().await;
        assert!(!session.is_connected());

        let err = session.sendline("ls", 0).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Infrastructure);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_shell_round_trip() {
        let session = ShellSession::spawn("local-shell", "sh")
            .unwrap()
            .with_prompts(vec!["READY".to_string()]);

        session.sendline("echo READY", 0).await.unwrap();
        session
            .wait(Some(Instant::now() + Duration::from_secs(10)))
            .await
            .unwrap();
        session.finalise().await;
        assert!(!session.is_connected());
    }
}
