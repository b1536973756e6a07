//! End to end exchange against a listening server, over a real socket.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use oxmail::db::Rcpthost;
use oxmail::server::ServerOxmail;
use oxmail::test_helpers::{local_test, test_context};

#[tokio::test]
async fn tcp_session_end_to_end() {
    let mut config = local_test();
    config.server.addr = "127.0.0.1:0".parse().unwrap();
    let test = test_context(config);
    test.db
        .rcpthost_create(&Rcpthost {
            hostname: "example.org".to_string(),
            is_local: false,
        })
        .await
        .unwrap();

    let server = ServerOxmail::new(
        test.ctx.config.clone(),
        test.db.clone(),
        test.store.clone(),
        test.publisher.clone(),
        test.ctx.resolver.clone(),
        None,
    )
    .await
    .unwrap();
    let addr = server.addr();
    tokio::spawn(async move { server.listen_and_serve().await });

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let banner = lines.next_line().await.unwrap().unwrap();
    assert!(banner.starts_with("220 mail.example ESMTP - "));

    write.write_all(b"EHLO client.example\r\n").await.unwrap();
    let mut ehlo_replies = vec![];
    loop {
        let line = lines.next_line().await.unwrap().unwrap();
        let done = line.starts_with("250 ");
        ehlo_replies.push(line);
        if done {
            break;
        }
    }
    assert_eq!(
        ehlo_replies,
        vec![
            "250-mail.example",
            "250-SIZE 10485760",
            "250-STARTTLS",
            "250 AUTH PLAIN",
        ]
    );

    write
        .write_all(b"MAIL FROM:<alice@example.net>\r\n")
        .await
        .unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "250 ok");

    write
        .write_all(b"RCPT TO:<bob@example.org>\r\n")
        .await
        .unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "250 ok");

    write.write_all(b"DATA\r\n").await.unwrap();
    assert_eq!(
        lines.next_line().await.unwrap().unwrap(),
        "354 End data with <CR><LF>.<CR><LF>"
    );

    write
        .write_all(b"Subject: over tcp\r\n\r\nhello\r\n.\r\n")
        .await
        .unwrap();
    let queued = lines.next_line().await.unwrap().unwrap();
    assert!(queued.starts_with("250 2.0.0 Ok: queued "));
    let uuid = queued.rsplit(' ').next().unwrap().to_string();

    write.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "221 2.0.0 Bye");

    // the deliverer side contract: one record, one body, one publish
    assert_eq!(test.db.queue_count_uuid(&uuid).await.unwrap(), 1);
    let (stored_uuid, _) = test.store.sole_object().unwrap();
    assert_eq!(stored_uuid, uuid);
    assert_eq!(test.publisher.published().len(), 1);
}
