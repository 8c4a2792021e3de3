//! セッションの統合テスト
//!
//! ローカルのWebSocketサーバーに接続し、受信からイベント送出までを確認する。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use highlive::config::{BufferConfig, DecoderConfig, SessionConfig};
use highlive::context::ChannelContext;
use highlive::decoder::{Normalizer, TagClassifier};
use highlive::error::HighliveResult;
use highlive::models::{ChannelId, ChatEvent, LiveStatus, PlatformKind};
use highlive::platform::{ChatPlatform, Chzzk, DecodeError, Decoded, RawFrame, WsStream};
use highlive::session::Session;

/// Chzzkのフレーム形式でローカルサーバーに接続するプラットフォーム
struct LocalChzzk {
    url: String,
    inner: Chzzk,
}

#[async_trait]
impl ChatPlatform for LocalChzzk {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Chzzk
    }

    async fn connect(&self, _status: &LiveStatus) -> HighliveResult<WsStream> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        Ok(ws)
    }

    fn build_keepalive(&self) -> Message {
        self.inner.build_keepalive()
    }

    fn split_frames(&self, message: &Message) -> Result<Vec<RawFrame>, DecodeError> {
        self.inner.split_frames(message)
    }

    fn decode_frame(&self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        self.inner.decode_frame(frame)
    }

    fn is_live(&self, status: &LiveStatus) -> bool {
        status.live
    }
}

fn chat_message(uid: &str, text: &str) -> Message {
    Message::Text(
        json!({
            "cmd": 93101,
            "bdy": [{"uid": uid, "msg": text, "msgTypeCode": 1}]
        })
        .to_string(),
    )
}

/// 1接続だけ受け付け、台本のメッセージを送ってから受信内容を返す
async fn start_server(script: Vec<Message>) -> (String, mpsc::Receiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (received_tx, received_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for message in script {
            ws.send(message).await.unwrap();
        }
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if let Ok(value) = serde_json::from_str(&text) {
                    let _ = received_tx.send(value).await;
                }
            }
        }
    });

    (url, received_rx)
}

fn live_context() -> Arc<ChannelContext> {
    let ctx = Arc::new(ChannelContext::new(ChannelId::new("ch"), "CH", PlatformKind::Chzzk));
    ctx.update_status(LiveStatus {
        live: true,
        ..Default::default()
    });
    ctx
}

async fn recv_event(rx: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_session_delivers_events_in_order() {
    let mut script: Vec<Message> = (0..6)
        .map(|i| chat_message(&format!("user{}", i), &format!("메시지 {}", i)))
        .collect();
    // 同じレコードの重複とスパムは落ちる
    let duplicate = json!({"uid": "user6", "msg": "메시지 6", "msgTypeCode": 1});
    script.push(Message::Text(
        json!({"cmd": 93101, "bdy": [duplicate.clone(), duplicate]}).to_string(),
    ));
    script.push(chat_message("spammer", "smartstore.naver.com/x"));
    script.push(Message::Text(json!({"ver": "2", "cmd": 0}).to_string()));

    let (url, mut received) = start_server(script).await;
    let ctx = live_context();
    let platform = Arc::new(LocalChzzk {
        url,
        inner: Chzzk::new(ctx.channel_id.clone()),
    });
    let normalizer = Normalizer::new(
        ctx.channel_id.clone(),
        Arc::new(TagClassifier::new()),
        &DecoderConfig::default(),
    );
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let session = Session::new(
        Arc::clone(&ctx),
        platform,
        normalizer,
        event_tx,
        SessionConfig::default(),
        BufferConfig::default(),
    );
    let handle = tokio::spawn(session.run());

    for i in 0..7 {
        let event = recv_event(&mut event_rx).await;
        assert_eq!(event.author, format!("user{}", i));
        assert_eq!(event.text, format!("메시지 {}", i));
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(300), event_rx.recv())
            .await
            .is_err()
    );

    // pingにはpongで応答する
    let mut answered = false;
    while let Ok(Some(value)) =
        tokio::time::timeout(Duration::from_secs(2), received.recv()).await
    {
        if value["cmd"] == 10000 {
            answered = true;
            break;
        }
    }
    assert!(answered);

    ctx.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_session_waits_while_offline() {
    let ctx = Arc::new(ChannelContext::new(ChannelId::new("ch"), "CH", PlatformKind::Chzzk));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let platform = Arc::new(LocalChzzk {
        url,
        inner: Chzzk::new(ctx.channel_id.clone()),
    });
    let normalizer = Normalizer::new(
        ctx.channel_id.clone(),
        Arc::new(TagClassifier::new()),
        &DecoderConfig::default(),
    );
    let (event_tx, _event_rx) = mpsc::channel(8);
    let session = Session::new(
        Arc::clone(&ctx),
        platform,
        normalizer,
        event_tx,
        SessionConfig::default(),
        BufferConfig::default(),
    );
    let handle = tokio::spawn(session.run());

    // オフラインの間は接続しない
    assert!(
        tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err()
    );

    // ライブになると接続する
    ctx.update_status(LiveStatus {
        live: true,
        ..Default::default()
    });
    let accepted = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
    assert!(accepted.is_ok());

    ctx.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not stop")
        .unwrap();
}

/// サーバー側で観測した接続の出来事
#[derive(Debug, PartialEq)]
enum ServerEvent {
    Handshake(usize),
    Closed(usize),
}

/// 何度でも接続を受け付け、ハンドシェイクと切断を報告する
async fn start_recording_server() -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut count = 0;
        while let Ok((stream, _)) = listener.accept().await {
            count += 1;
            let id = count;
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let _ = tx.send(ServerEvent::Handshake(id));
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                }
                let _ = tx.send(ServerEvent::Closed(id));
            });
        }
    });

    (url, rx)
}

async fn next_server_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for server")
        .expect("server stopped")
}

fn spawn_session(
    ctx: &Arc<ChannelContext>,
    url: String,
    config: SessionConfig,
) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<ChatEvent>) {
    let platform = Arc::new(LocalChzzk {
        url,
        inner: Chzzk::new(ctx.channel_id.clone()),
    });
    let normalizer = Normalizer::new(
        ctx.channel_id.clone(),
        Arc::new(TagClassifier::new()),
        &DecoderConfig::default(),
    );
    let (event_tx, event_rx) = mpsc::channel(64);
    let session = Session::new(
        Arc::clone(ctx),
        platform,
        normalizer,
        event_tx,
        config,
        BufferConfig::default(),
    );
    (tokio::spawn(session.run()), event_rx)
}

fn quick_config() -> SessionConfig {
    SessionConfig {
        read_timeout_ms: 50,
        reconnect_delay_secs: 0,
        offline_grace_secs: 1,
        cancel_timeout_ms: 300,
        ..Default::default()
    }
}

async fn stop(ctx: &ChannelContext, handle: tokio::task::JoinHandle<()>) {
    ctx.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_forced_rejoin_reconnects() {
    let (url, mut server) = start_recording_server().await;
    let ctx = live_context();
    let (handle, _events) = spawn_session(&ctx, url, quick_config());

    assert_eq!(next_server_event(&mut server).await, ServerEvent::Handshake(1));

    ctx.request_rejoin();
    // 古い接続が閉じられ、新しいハンドシェイクが来る
    let mut seen = vec![
        next_server_event(&mut server).await,
        next_server_event(&mut server).await,
    ];
    seen.sort_by_key(|event| match event {
        ServerEvent::Closed(_) => 0,
        ServerEvent::Handshake(_) => 1,
    });
    assert_eq!(seen, vec![ServerEvent::Closed(1), ServerEvent::Handshake(2)]);
    assert!(!ctx.take_rejoin());

    stop(&ctx, handle).await;
}

#[tokio::test]
async fn test_offline_grace_closes_quiet_connection() {
    let (url, mut server) = start_recording_server().await;
    let ctx = live_context();
    let (handle, _events) = spawn_session(&ctx, url, quick_config());

    assert_eq!(next_server_event(&mut server).await, ServerEvent::Handshake(1));

    let offline_at = Instant::now();
    ctx.update_status(LiveStatus {
        live: false,
        ..Default::default()
    });

    // 猶予が過ぎるまでは切断しない
    assert!(
        tokio::time::timeout(Duration::from_millis(500), server.recv())
            .await
            .is_err()
    );
    assert_eq!(next_server_event(&mut server).await, ServerEvent::Closed(1));
    assert!(offline_at.elapsed() >= Duration::from_millis(500));

    // オフラインの間は再接続しない
    assert!(
        tokio::time::timeout(Duration::from_millis(300), server.recv())
            .await
            .is_err()
    );

    stop(&ctx, handle).await;
}
