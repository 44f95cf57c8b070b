//! Handling of frames pushed by the server.

use tidings_sync_types::{DataEvent, DeleteTarget, MetaEvent, PresWhat, ServerMessage};
use tracing::debug;

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;

impl<T: Transport> Session<T> {
    /// Apply one server frame to the local state.
    pub async fn handle(&self, msg: ServerMessage) -> Result<(), ClientError> {
        match msg {
            ServerMessage::Data(data) => self.on_data(data).await,
            ServerMessage::Info(info) => self.reconciler().on_info(&info).await.map(|_| ()),
            ServerMessage::Meta(meta) => self.on_meta(meta).await,
            ServerMessage::Pres(pres) => {
                let online = pres.what == PresWhat::On;
                self.store().topic_set_online(&pres.topic, online).await?;
                self.emit(ClientEvent::Presence {
                    topic: pres.topic,
                    online,
                });
                Ok(())
            }
            ServerMessage::Ctrl(ctrl) => {
                debug!("Ignoring unsolicited ctrl {} {}", ctrl.code, ctrl.text);
                Ok(())
            }
        }
    }

    async fn on_data(&self, data: DataEvent) -> Result<(), ClientError> {
        let id = self
            .store()
            .msg_received(&data.topic, data.seq, &data.from, &data.content, data.ts)
            .await?;
        self.emit(ClientEvent::MessageReceived {
            topic: data.topic.clone(),
            id,
            seq: data.seq,
        });

        if self.config().sync.mark_recv_on_data && data.from != *self.user() {
            match self.reconciler().note_recv(&data.topic, data.seq).await {
                Ok(_) | Err(ClientError::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn on_meta(&self, meta: MetaEvent) -> Result<(), ClientError> {
        let reconciler = self.reconciler();
        if let Some(desc) = &meta.desc {
            reconciler.apply_desc(&meta.topic, desc).await?;
        }
        if !meta.sub.is_empty() {
            reconciler.apply_subs(&meta.topic, &meta.sub).await?;
        }
        for range in meta.del {
            let changed = self
                .lifecycle()
                .apply_delete(&meta.topic, &DeleteTarget::Range(range), true)
                .await?;
            if changed > 0 {
                self.emit(ClientEvent::Refresh {
                    topic: meta.topic.clone(),
                    range,
                });
            }
        }
        Ok(())
    }
}
