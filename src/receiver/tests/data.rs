/*
 * oxmail mail transfer agent
 * Copyright (C) 2022 the oxmail authors
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 *  This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
**/
use crate::db::Rcpthost;
use crate::queue;
use crate::test_helpers::{local_test, test_context, TestContext};

const BANNER: &str = "220 mail.example ESMTP - {any}";

async fn relayable(test: &TestContext) {
    test.db
        .rcpthost_create(&Rcpthost {
            hostname: "example.org".to_string(),
            is_local: false,
        })
        .await
        .unwrap();
}

fn transaction(body: &str) -> String {
    [
        "MAIL FROM:<alice@example.net>\r\n",
        "RCPT TO:<bob@example.org>\r\n",
        "DATA\r\n",
        body,
        "QUIT\r\n",
    ]
    .concat()
}

#[tokio::test(start_paused = true)]
async fn data_out_of_sequence() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "DATA\r\nQUIT\r\n",
        [
            BANNER,
            "503 5.5.1 command out of sequence",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn dot_stuffed_line_is_unstuffed_in_the_stored_body() {
    let test = test_context(local_test());
    relayable(&test).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        transaction("Subject: x\r\n\r\n..hello\r\n.\r\n").as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "250 2.0.0 Ok: queued {any}",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    let (_, body) = test.store.sole_object().expect("one stored body");
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("\r\n.hello\r\n"));
    assert!(!body.contains("\r\n..hello\r\n"));
}

#[tokio::test]
async fn existing_message_id_is_kept() {
    let test = test_context(local_test());
    relayable(&test).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        transaction("Message-ID: <known@example.net>\r\n\r\nbody\r\n.\r\n").as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "250 2.0.0 Ok: queued {any}",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    let records = queue::list_messages(&test.db).await.unwrap();
    assert_eq!(records[0].message_id, "known@example.net");
    let (_, body) = test.store.sole_object().unwrap();
    let body = String::from_utf8(body).unwrap();
    // no second Message-ID was synthesized
    assert_eq!(body.matches("Message-ID:").count(), 1);
}

#[tokio::test]
async fn too_many_hops_is_a_loop() {
    let mut config = local_test();
    config.smtpd.max_hops = 100;
    let test = test_context(config);
    relayable(&test).await;

    let looping = "Received: by relay.example\r\n".repeat(101);
    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        transaction(&format!("{}\r\nbody\r\n.\r\n", looping)).as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "554 5.4.6 too many hops, this message is looping",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    assert_eq!(queue::count(&test.db).await.unwrap(), 0);
    assert!(test.store.is_empty());
    assert!(test.publisher.published().is_empty());
}

#[tokio::test]
async fn hundred_hops_still_pass() {
    let mut config = local_test();
    config.smtpd.max_hops = 100;
    let test = test_context(config);
    relayable(&test).await;

    let heavy = "Received: by relay.example\r\n".repeat(100);
    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        transaction(&format!("{}\r\nbody\r\n.\r\n", heavy)).as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "250 2.0.0 Ok: queued {any}",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    assert_eq!(queue::count(&test.db).await.unwrap(), 1);
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let mut config = local_test();
    config.smtpd.max_data_bytes = 64;
    let test = test_context(config);
    relayable(&test).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        transaction(&format!("{}\r\n.\r\n", "x".repeat(100))).as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "552 5.3.4 sorry, that message size exceeds my databytes limit",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    assert!(test.store.is_empty());
}

#[tokio::test]
async fn stray_newline_aborts_the_transfer() {
    let test = test_context(local_test());
    relayable(&test).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        transaction("bare linefeed\nQUIT\r\n").as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "451 You send me LF not preceded by a CR, your SMTP client is broken.",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    assert!(test.store.is_empty());
}

#[tokio::test]
async fn queue_failure_answers_451() {
    let test = test_context(local_test());
    relayable(&test).await;
    let ctx = crate::receiver::SessionContext {
        publisher: std::sync::Arc::new(crate::test_helpers::FailingPublisher),
        ..test.ctx.clone()
    };

    crate::test_helpers::test_receiver_inner(
        ctx,
        transaction("Subject: x\r\n\r\nbody\r\n.\r\n").as_str(),
        [
            BANNER,
            "250 ok",
            "250 ok",
            "354 End data with <CR><LF>.<CR><LF>",
            "451 temporary queue error",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();

    // the compensation left nothing behind
    assert_eq!(queue::count(&test.db).await.unwrap(), 0);
    assert!(test.store.is_empty());
}
