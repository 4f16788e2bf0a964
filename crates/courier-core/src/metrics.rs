// Metrics for the event bus
// Counters for message flow and reply outcomes, gauges for live state

use metrics::{counter, describe_counter, describe_gauge, gauge};

use courier_common::ReplyFailure;

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(
        "courier_messages_sent_total",
        "Total number of point-to-point messages sent"
    );
    describe_counter!(
        "courier_messages_published_total",
        "Total number of messages published"
    );
    describe_counter!(
        "courier_messages_delivered_total",
        "Total number of messages handed to local handlers"
    );
    describe_counter!(
        "courier_messages_dropped_total",
        "Total number of messages dropped before reaching a handler"
    );
    describe_counter!(
        "courier_frames_received_total",
        "Total number of wire frames received from other nodes"
    );
    describe_counter!(
        "courier_frames_transmitted_total",
        "Total number of wire frames transmitted to other nodes"
    );
    describe_counter!(
        "courier_replies_total",
        "Total number of reply exchanges by outcome"
    );
    describe_gauge!(
        "courier_registrations",
        "Current number of live handler registrations"
    );
    describe_gauge!(
        "courier_pending_replies",
        "Current number of reply exchanges awaiting a reply"
    );

    tracing::info!("Metrics initialized");
}

pub fn record_send(send: bool) {
    if send {
        counter!("courier_messages_sent_total").increment(1);
    } else {
        counter!("courier_messages_published_total").increment(1);
    }
}

pub fn record_delivered(count: usize) {
    counter!("courier_messages_delivered_total").increment(count as u64);
}

pub fn record_dropped(reason: &'static str) {
    counter!("courier_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn record_frame_received() {
    counter!("courier_frames_received_total").increment(1);
}

pub fn record_frame_transmitted() {
    counter!("courier_frames_transmitted_total").increment(1);
}

/// Record the end of a reply exchange; `None` means a reply arrived.
pub fn record_reply_outcome(failure: Option<ReplyFailure>) {
    let outcome = failure.map_or("REPLIED", ReplyFailure::as_str);
    counter!("courier_replies_total", "outcome" => outcome).increment(1);
}

pub fn set_registrations(count: usize) {
    gauge!("courier_registrations").set(count as f64);
}

pub fn set_pending_replies(count: usize) {
    gauge!("courier_pending_replies").set(count as f64);
}
