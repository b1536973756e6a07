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
use crate::db::Db;
use crate::log_channels;
use crate::model::envelop::Envelop;
use crate::model::mail;
use crate::publish::QueuePublisher;
use crate::store::{self, Storer};

/// delivery in progress
pub const STATUS_IN_PROGRESS: u32 = 0;
/// to be discarded on the next delivery attempt
pub const STATUS_DISCARDED: u32 = 1;
/// scheduled for delivery
pub const STATUS_SCHEDULED: u32 = 2;
/// to be bounced on the next delivery attempt
pub const STATUS_BOUNCED: u32 = 3;

/// One queued recipient of an accepted message.
///
/// All the records of one DATA share the same `uuid`, which is also the
/// content-store key of the message body. The body exists exactly as long
/// as at least one record references it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QMessage {
    pub id: i64,
    pub uuid: String,
    pub mail_from: String,
    /// login of the authenticated submitter, empty when unauthenticated
    pub auth_user: String,
    pub rcpt_to: String,
    pub message_id: String,
    /// destination part of `rcpt_to`
    pub host: String,
    pub added_at: chrono::DateTime<chrono::Utc>,
    pub last_update: chrono::DateTime<chrono::Utc>,
    pub next_delivery_scheduled_at: chrono::DateTime<chrono::Utc>,
    pub status: u32,
    pub delivery_failed_count: u32,
}

impl QMessage {
    /// Remove the record; when it was the last reference to the uuid the
    /// stored body goes too. A body already missing at that point is not
    /// an error.
    pub async fn delete(&self, db: &Db, store: &dyn Storer) -> anyhow::Result<()> {
        let remaining = db.queue_delete_counting_refs(self.id, &self.uuid).await?;
        if remaining != 0 {
            return Ok(());
        }
        match store.del(&self.uuid).await {
            Err(e) if !store::is_not_found(&e) => Err(e),
            _ => Ok(()),
        }
    }

    /// reload this record from the database
    pub async fn update_from_db(&mut self, db: &Db) -> anyhow::Result<()> {
        *self = db
            .queue_get(self.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("queue record {} no longer exists", self.id))?;
        Ok(())
    }

    pub async fn save_in_db(&mut self, db: &Db) -> anyhow::Result<()> {
        self.last_update = chrono::Utc::now();
        db.queue_save(self).await
    }

    /// mark the message to be discarded on the next delivery attempt
    pub async fn discard(&mut self, db: &Db) -> anyhow::Result<()> {
        self.set_status(db, STATUS_DISCARDED).await
    }

    /// mark the message to be bounced on the next delivery attempt
    pub async fn bounce(&mut self, db: &Db) -> anyhow::Result<()> {
        self.set_status(db, STATUS_BOUNCED).await
    }

    async fn set_status(&mut self, db: &Db, status: u32) -> anyhow::Result<()> {
        // status 0 records belong to a deliverer; the update below re-checks
        // the gate inside the database so a concurrent take cannot be undone
        if self.status == STATUS_IN_PROGRESS {
            anyhow::bail!("delivery in progress, message status can't be changed");
        }
        if db.queue_set_status(self.id, status).await? == 0 {
            anyhow::bail!("delivery in progress, message status can't be changed");
        }
        self.status = status;
        self.last_update = chrono::Utc::now();
        Ok(())
    }
}

pub async fn get_message_by_id(db: &Db, id: i64) -> anyhow::Result<Option<QMessage>> {
    db.queue_get(id).await
}

pub async fn list_messages(db: &Db) -> anyhow::Result<Vec<QMessage>> {
    db.queue_list().await
}

pub async fn count(db: &Db) -> anyhow::Result<i64> {
    db.queue_count().await
}

/// records stuck for more than a day
pub async fn get_expired_messages(db: &Db) -> anyhow::Result<Vec<QMessage>> {
    db.queue_expired(chrono::Utc::now() - chrono::Duration::hours(24))
        .await
}

/// Accept a message into the queue.
///
/// The body is stored once under a fresh uuid, then one record per
/// recipient is created and published on `topic`. Failures compensate so
/// the body is never left without at least one record referencing it:
/// * the very first record failing to be created removes the stored body,
/// * a later record failing leaves the earlier ones in place (they
///   reference a valid body and the deliverer is idempotent per record),
/// * a record failing to publish is deleted again, which also removes the
///   body when it was the only reference.
pub async fn add_message(
    db: &Db,
    store: &dyn Storer,
    publisher: &dyn QueuePublisher,
    topic: &str,
    raw_mail: &[u8],
    envelop: &Envelop,
    auth_user: &str,
) -> anyhow::Result<String> {
    let uuid = uuid::Uuid::new_v4().to_string();
    store.put(&uuid, raw_mail).await?;

    let message_id = mail::raw_get_message_id(raw_mail);

    let mut qmessages = vec![];
    for (created, rcpt_to) in envelop.rcpt_to.iter().enumerate() {
        let now = chrono::Utc::now();
        let mut qm = QMessage {
            id: 0,
            uuid: uuid.clone(),
            mail_from: envelop.mail_from.clone(),
            auth_user: auth_user.to_string(),
            rcpt_to: rcpt_to.clone(),
            message_id: message_id.clone(),
            host: mail::get_host_from_address(rcpt_to),
            added_at: now,
            last_update: now,
            next_delivery_scheduled_at: now,
            status: STATUS_SCHEDULED,
            delivery_failed_count: 0,
        };
        match db.queue_create(&qm).await {
            Ok(id) => qm.id = id,
            Err(e) => {
                if created == 0 {
                    if let Err(del) = store.del(&uuid).await {
                        if !store::is_not_found(&del) {
                            log::error!(
                                target: log_channels::QUEUE,
                                "cannot clean the store after a failed record: {}",
                                del
                            );
                        }
                    }
                }
                return Err(e);
            }
        }
        qmessages.push(qm);
    }

    for qm in &qmessages {
        let published = match serde_json::to_vec(qm) {
            Ok(payload) => publisher.publish(topic, payload).await,
            Err(e) => Err(anyhow::Error::new(e)),
        };
        if let Err(e) = published {
            if let Err(del) = qm.delete(db, store).await {
                log::error!(
                    target: log_channels::QUEUE,
                    "cannot clean record {} after a failed publish: {}",
                    qm.id,
                    del
                );
            }
            return Err(e);
        }
    }

    Ok(uuid)
}
