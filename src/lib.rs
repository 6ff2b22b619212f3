//! HinariAdsBot Forwarder Library
//!
//! Keeps one background forwarder per connected Telegram account. Each
//! forwarder re-sends the account's latest Saved Message to every group
//! the account belongs to, as long as the account advertises the bot in
//! its bio and its owner's subscription is active.
//!
//! This crate provides the core functionality for:
//! - Loading service settings from the environment
//! - Persisting accounts and per-user settings
//! - Talking to Telegram via `MTProto`
//! - Supervising per-account forwarders
//! - Handling operator console commands

pub mod commands;
pub mod config;
pub mod forwarder;
pub mod notify;
pub mod store;
pub mod telegram;
