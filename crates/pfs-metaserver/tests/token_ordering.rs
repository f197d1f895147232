//! Integration test for the token directory's revocation ordering
//! guarantee: a grant must not be emitted until every conflicting
//! revocation has been dispatched. Wired to real `tokio::sync::mpsc`
//! channels instead of the in-memory recording sink `tokens.rs` uses for
//! its own unit tests.

use pfs_config::TokenKind;
use pfs_metaserver::tokens::Notification;
use pfs_metaserver::TokenDirectory;
use tokio::sync::mpsc;

struct ChannelSink {
    tx: mpsc::UnboundedSender<(u64, Notification)>,
}

impl pfs_metaserver::tokens::NotificationSink for ChannelSink {
    fn notify(&self, client_id: u64, notification: Notification) {
        let _ = self.tx.send((client_id, notification));
    }
}

#[tokio::test]
async fn grant_is_the_last_event_after_every_conflicting_revocation() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dir = TokenDirectory::new(ChannelSink { tx });

    // Three readers hold overlapping ranges on the same file.
    dir.request("f", 0, 99, TokenKind::Read, 1);
    dir.request("f", 0, 99, TokenKind::Read, 2);
    dir.request("f", 0, 99, TokenKind::Read, 3);

    // Drain the three initial grants before the conflicting write request.
    for _ in 0..3 {
        rx.recv().await.unwrap();
    }

    // A write request conflicts with all three readers.
    dir.request("f", 0, 99, TokenKind::Write, 4);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(events.len(), 4, "3 revocations + 1 grant");
    let (last_client, last_notification) = events.last().unwrap();
    assert_eq!(*last_client, 4);
    assert!(matches!(last_notification, Notification::Grant { .. }));

    for (client_id, notification) in &events[..3] {
        assert!(matches!(notification, Notification::Revocation { .. }));
        assert!([1, 2, 3].contains(client_id));
    }
}

#[tokio::test]
async fn non_conflicting_requests_never_revoke() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dir = TokenDirectory::new(ChannelSink { tx });

    dir.request("f", 0, 9, TokenKind::Read, 1);
    dir.request("f", 20, 29, TokenKind::Read, 2);

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(matches!(first.1, Notification::Grant { .. }));
    assert!(matches!(second.1, Notification::Grant { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn released_tokens_generate_no_revocation_on_next_request() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dir = TokenDirectory::new(ChannelSink { tx });

    dir.request("f", 0, 9, TokenKind::Write, 1);
    rx.recv().await.unwrap();

    dir.release_all("f", 1);
    dir.request("f", 0, 9, TokenKind::Write, 2);

    let grant = rx.recv().await.unwrap();
    assert!(matches!(grant.1, Notification::Grant { .. }));
    assert_eq!(grant.0, 2);
    assert!(rx.try_recv().is_err());
}
