#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]
#![doc = include_str!("../README.md")]

// This must go FIRST so that all the other modules see its macros.
mod fmt;

pub(crate) mod internal;

pub mod regs;
pub mod sleep;
pub mod time;

pub mod dma;
pub mod flash;
pub mod i2c;
pub mod pipe;
pub mod rmu;
pub mod usart;
pub mod usb;
