//! Glue between the AMQP client and the gateway core.

use crate::dispatch::{Acknowledger, InboundMessage};
use crate::error::Result;
use crate::header::GroupId;
use crate::registry::Binder;
use amqp_client::{AmqpClient, Consumer};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};

#[async_trait]
impl Binder for AmqpClient {
    async fn bind(&self, group: &GroupId) -> Result<()> {
        AmqpClient::bind(self, &group.binding_key()).await?;
        Ok(())
    }

    async fn unbind(&self, group: &GroupId) -> Result<()> {
        AmqpClient::unbind(self, &group.binding_key()).await?;
        Ok(())
    }
}

/// Settles a lapin delivery.
pub struct DeliveryAcker(Acker);

#[async_trait]
impl Acknowledger for DeliveryAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue: false }).await?;
        Ok(())
    }
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        InboundMessage {
            delivery_tag: delivery.delivery_tag,
            headers: delivery.properties.headers().clone(),
            payload: Bytes::from(delivery.data),
            acker: Box::new(DeliveryAcker(delivery.acker)),
        }
    }
}

/// Adapt a lapin consumer into the pipeline's delivery stream.
pub fn deliveries(consumer: Consumer) -> BoxStream<'static, Result<InboundMessage>> {
    consumer
        .map(|delivery| -> Result<InboundMessage> { Ok(InboundMessage::from(delivery?)) })
        .boxed()
}
