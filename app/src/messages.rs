use std::sync::mpsc::{Receiver, Sender};

use sip_core::{
    DialogCallback, InDialogCallback, PublishCallback, RequestId, SipDialogId, SubscribeCallback,
};

/// Something the loopback network hands back to the user agent.
#[derive(Debug)]
pub enum Delivery {
    Subscribe(RequestId, SubscribeCallback),
    InDialog(RequestId, InDialogCallback),
    Dialog(SipDialogId, DialogCallback),
    Publish(RequestId, PublishCallback),
}

pub type DeliverySender = Sender<Delivery>;
pub type DeliveryReceiver = Receiver<Delivery>;
