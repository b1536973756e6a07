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
use crate::db::{Rcpthost, User};
use crate::queue;
use crate::test_helpers::{local_test, test_context, test_context_with, StaticLookup, TestContext};

const BANNER: &str = "220 mail.example ESMTP - {any}";

async fn with_relay_host(test: &TestContext, hostname: &str, is_local: bool) {
    test.db
        .rcpthost_create(&Rcpthost {
            hostname: hostname.to_string(),
            is_local,
        })
        .await
        .unwrap();
}

async fn with_mailbox(test: &TestContext, login: &str) {
    test.db
        .user_create(&User {
            login: login.to_string(),
            passwd: pwhash::bcrypt::hash("secret").unwrap(),
            auth_relay: false,
            have_mailbox: true,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_one_recipient() {
    let test = test_context(local_test());
    with_relay_host(&test, "example.org", false).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "EHLO client.example\r\n",
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<bob@example.org>\r\n",
            "DATA\r\n",
            "Subject: hi\r\n\r\nhello\r\n.\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "250-mail.example",
            "250-SIZE 10485760",
            "250-STARTTLS",
            "250 AUTH PLAIN",
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
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].mail_from, "alice@example.net");
    assert_eq!(records[0].rcpt_to, "bob@example.org");
    assert_eq!(records[0].host, "example.org");
    assert_eq!(records[0].status, queue::STATUS_SCHEDULED);
    assert_eq!(records[0].auth_user, "");

    let (uuid, body) = test.store.sole_object().expect("exactly one stored body");
    assert_eq!(uuid, records[0].uuid);
    let body = String::from_utf8(body).unwrap();
    assert!(body.starts_with("X-Env-From: alice@example.net\r\nReceived: from client.example "));
    let received_end = body.find("\r\nMessage-ID: <").expect("a synthesized Message-ID");
    assert!(body[..received_end].contains("with SMTP;"));
    assert!(body.contains("\r\nSubject: hi\r\n"));

    let published = test.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "todeliver");
}

#[tokio::test(start_paused = true)]
async fn rcpt_before_mail_is_out_of_sequence() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "RCPT TO:<bob@example.org>\r\n",
            "MAIL FROM:<a@b.example>\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "503 5.5.1 bad sequence",
            "250 ok",
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
async fn null_reverse_path_is_accepted() {
    let test = test_context(local_test());
    with_relay_host(&test, "example.org", false).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "MAIL FROM:<>\r\nRCPT TO:<bob@example.org>\r\nQUIT\r\n",
        [BANNER, "250 ok", "250 ok", "221 2.0.0 Bye", ""]
            .join("\r\n")
            .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn source_route_is_stripped() {
    let test = test_context(local_test());
    with_relay_host(&test, "example.org", false).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<@relay1.example,@relay2.example:bob@Example.ORG>\r\n",
            "DATA\r\n",
            "Subject: x\r\n\r\n.\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
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
    assert_eq!(records.len(), 1);
    // routing stripped, domain lowercased once at input
    assert_eq!(records[0].rcpt_to, "bob@example.org");
}

#[tokio::test]
async fn duplicate_recipients_are_dropped() {
    let test = test_context(local_test());
    with_relay_host(&test, "example.org", false).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<bob@example.org>\r\n",
            "RCPT TO:<bob@example.org>\r\n",
            "DATA\r\n",
            "Subject: x\r\n\r\n.\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "250 ok",
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
    assert_eq!(test.store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn relay_denied_without_any_grant() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<bob@elsewhere.example>\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "250 ok",
            "554 5.7.1 Relay access denied",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn local_host_without_mailbox_is_refused() {
    let mut config = local_test();
    config.smtpd.max_bad_rcpt_to = 1;
    let test = test_context(config);
    with_relay_host(&test, "example.org", true).await;
    with_mailbox(&test, "bob@example.org").await;

    // the second bad recipient crosses max_bad_rcpt_to, the connection drops
    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<ghost@example.org>\r\n",
            "RCPT TO:<phantom@example.org>\r\n",
            "RCPT TO:<bob@example.org>\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "250 ok",
            "550 5.5.1 Sorry, no mailbox here by that name",
            "550 5.5.1 Sorry, no mailbox here by that name",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn local_mailbox_is_accepted() {
    let test = test_context(local_test());
    with_relay_host(&test, "example.org", true).await;
    with_mailbox(&test, "bob@example.org").await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<bob@example.org>\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [BANNER, "250 ok", "250 ok", "221 2.0.0 Bye", ""]
            .join("\r\n")
            .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn allowlisted_address_may_relay() {
    let mut config = local_test();
    config.smtpd.relay_allowed_ips = vec!["127.0.0.1".parse().unwrap()];
    let test = test_context(config);

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "RCPT TO:<bob@elsewhere.example>\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [BANNER, "250 ok", "250 ok", "221 2.0.0 Bye", ""]
            .join("\r\n")
            .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn helo_mandatory_and_rset_keeps_the_hello() {
    let mut config = local_test();
    config.rfc.helo_mandatory = true;
    let test = test_context(config);
    with_relay_host(&test, "example.org", false).await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL FROM:<alice@example.net>\r\n",
            "EHLO client.example\r\n",
            "MAIL FROM:<alice@example.net>\r\n",
            "RSET\r\n",
            "MAIL FROM:<alice@example.net>\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "503 5.5.2 Send hello first",
            "250-mail.example",
            "250-SIZE 10485760",
            "250-STARTTLS",
            "250 AUTH PLAIN",
            "250 ok",
            "250 2.0.0 ok",
            "250 ok",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn second_hello_is_refused() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "HELO one.example\r\nHELO two.example\r\nQUIT\r\n",
        [
            BANNER,
            "250 mail.example",
            "503 bad sequence, ehlo already received",
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
async fn helo_needs_fqdn_or_address() {
    let mut config = local_test();
    config.rfc.helo_needs_fqn_or_address = true;
    let mut resolver = StaticLookup::with_fqdns(&["client.example"]);
    resolver.failing.insert("slow.example".to_string());
    let test = test_context_with(config, std::sync::Arc::new(resolver));

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "HELO unknown.invalid\r\n",
            "HELO slow.example\r\n",
            "HELO 192.0.2.1\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "504 helo command rejected, need fully-qualified hostname or address #5.5.2",
            "404 unable to resolve slow.example. Need fqdn or address in helo command",
            "250 mail.example",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn mail_from_validation() {
    let mut resolver = StaticLookup::with_fqdns(&["example.net"]);
    resolver.failing.insert("slow.example".to_string());
    let test = test_context_with(local_test(), std::sync::Arc::new(resolver));

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "MAIL\r\n".to_string(),
            "MAIL FROM:<alice>\r\n".to_string(),
            "MAIL FROM:<alice@nxdomain.example>\r\n".to_string(),
            "MAIL FROM:<alice@slow.example>\r\n".to_string(),
            format!("MAIL FROM:<{}@example.net>\r\n", "x".repeat(65)),
            format!("MAIL FROM:<a@{}.example.net>\r\n", "d".repeat(300)),
            "MAIL FROM:<alice@example.net> SIZE=99999999\r\n".to_string(),
            "MAIL FROM:<alice@example.net> PEPPER=1\r\n".to_string(),
            "MAIL FROM:<alice@example.net> SIZE=12 OTHER=2\r\n".to_string(),
            "MAIL FROM:<alice@example.net> SIZE=12\r\n".to_string(),
            "QUIT\r\n".to_string(),
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "501 5.5.4 Syntax: MAIL FROM:<address> [SIZE]",
            "501 5.1.7 Invalid address",
            "550 5.5.2 need fully-qualified hostname for domain part",
            "451 unable to resolve slow.example due to timeout or srv failure",
            "550 local part of reverse path must not exceed 64 char (RFC 5321 4.5.3.1.1)",
            "550 reverse path must not exceed 256 char (RFC 5321 4.5.3.1.3)",
            "552 message exceeds fixed maximum message size",
            "501 5.5.4 Invalid arguments",
            "501 5.5.4 Syntax: MAIL FROM:<address> [SIZE]",
            "250 ok",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn vrfy_answers_by_locality() {
    let mut config = local_test();
    config.smtpd.max_vrfy = 4;
    let test = test_context(config);
    with_relay_host(&test, "example.org", true).await;
    with_relay_host(&test, "example.com", false).await;
    with_mailbox(&test, "bob@example.org").await;

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        [
            "VRFY <bob@Example.ORG>\r\n",
            "VRFY <carol@example.com>\r\n",
            "VRFY <ghost@example.org>\r\n",
            "VRFY <nobody@elsewhere.example>\r\n",
            "VRFY <bob@example.org>\r\n",
            "QUIT\r\n",
        ]
        .concat()
        .as_str(),
        [
            BANNER,
            "250 <bob@example.org>",
            "252 <carol@example.com>",
            "551 5.5.1 <ghost@example.org> no mailbox here by that name",
            "551 5.5.1 <nobody@elsewhere.example> no mailbox here by that name",
            "551 5.5.3 too many VRFY commands for this session",
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
async fn expn_is_not_expanded() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "EXPN staff\r\nQUIT\r\n",
        [BANNER, "252", "221 2.0.0 Bye", ""].join("\r\n").as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn unknown_verbs_and_empty_lines() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "\r\nBREW coffee\r\nNOOP\r\nQUIT\r\n",
        [
            BANNER,
            "502 5.5.1 unimplemented",
            "250 2.0.0 ok",
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
async fn admission_over_capacity_is_refused() {
    let test = test_context(local_test());
    test.ctx
        .sessions
        .store(50, std::sync::atomic::Ordering::Relaxed);

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "EHLO client.example\r\n",
        concat!(
            "421 sorry, the maximum number of connections has been reached, ",
            "try again later {uuid}\r\n"
        ),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn starttls_without_server_keys_keeps_the_session() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "STARTTLS\r\nNOOP\r\nQUIT\r\n",
        [
            BANNER,
            "454 TLS failed unable to load server keys{any}",
            "250 2.0.0 ok",
            "221 2.0.0 Bye",
            "",
        ]
        .join("\r\n")
        .as_str(),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_client_times_out() {
    let test = test_context(local_test());

    crate::test_helpers::test_receiver_inner(
        test.ctx.clone(),
        "{hang}NOOP\r\n",
        [BANNER, "250 2.0.0 ok", "420 Client timeout", ""]
            .join("\r\n")
            .as_str(),
    )
    .await
    .unwrap();
}
