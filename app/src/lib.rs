use std::sync::mpsc::channel;

use log::info;
use thiserror::Error;

use crate::driver::Driver;

mod driver;
mod loopback;
mod messages;
mod settings;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("sip error: {0}")]
    Sip(#[from] sip_core::SipError),
    #[error("{0} engines still registered after shutdown")]
    Incomplete(usize),
}

pub fn run() -> Result<(), AppError> {
    info!("starting SIP events demo");

    let (outbox, inbox) = channel::<messages::Delivery>();
    let mut driver = Driver::new(&settings::SETTINGS, outbox, inbox);
    driver.run()
}
