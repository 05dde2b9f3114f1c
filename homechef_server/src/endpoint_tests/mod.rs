mod helpers;
mod mocks;

mod auth;
mod misc;
mod orders;
mod webhooks;
