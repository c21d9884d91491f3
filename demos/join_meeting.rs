use std::error::Error;

use chapterconnect_realtime::realtime::client::{
    ConnectionParams, SessionClient, LOCAL_SESSION_ENDPOINT,
};
use chapterconnect_realtime::realtime::meeting::MeetingSession;
use chapterconnect_realtime::realtime::proto::ServerEvent;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let meeting_id = "REPLACE_WITH_MEETING_ID".to_string();
    let guest_name = "Demo Guest".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = SessionClient::new();
        let params = ConnectionParams::guest(LOCAL_SESSION_ENDPOINT, meeting_id, guest_name);

        let mut session = MeetingSession::join(&client, params).await?;
        session.send_chat("hello from rust");

        while let Some(event) = session.recv().await {
            match event {
                ServerEvent::Connected => println!("joined meeting={}", session.session_id()),
                ServerEvent::Message(message) => println!(
                    "{}: {}",
                    message.from.as_deref().unwrap_or("unknown"),
                    message.text.as_deref().unwrap_or_default()
                ),
                ServerEvent::UserJoined(_)
                | ServerEvent::UserLeft(_)
                | ServerEvent::ParticipantList(_) => {
                    println!("participants={}", session.participants().len());
                }
                ServerEvent::MeetingEnded => println!("meeting ended"),
                _ => {}
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
