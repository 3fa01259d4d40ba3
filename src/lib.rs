// Host runtime for a three-channel DC motor controller board on a serial link
//
// Wire protocol (newline-delimited JSON):
// - out: {"mot1":<pwm>,"mot2":<pwm>,"mot3":<pwm>}
// - in:  {"h1":<limit bits>,"cu1":<mA>,...,"err1":<0|1>,"err2":<0|1>}

pub mod config;
pub mod console;
pub mod controller;
pub mod link;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod scheduler;
pub mod surface;
pub mod telemetry;
