use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by a bitswap node.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "bitswap")]
pub struct Metrics {
    /*
     * Messages
     */
    #[metrics(help = "Number of messages received.")]
    pub messages_received: Counter,
    #[metrics(help = "Number of messages sent.")]
    pub messages_sent: Counter,
    #[metrics(help = "Number of messages that could not be delivered after all retries.")]
    pub message_send_failures: Counter,
    #[metrics(help = "Number of inbound frames that failed to decode.")]
    pub decode_errors: Counter,

    /*
     * Blocks and presences
     */
    #[metrics(help = "Number of blocks received.")]
    pub blocks_received: Counter,
    #[metrics(help = "Number of blocks received that we already had.")]
    pub duplicate_blocks_received: Counter,
    #[metrics(help = "Number of bytes received in blocks that we already had.")]
    pub duplicate_data_received: Counter,
    #[metrics(help = "Number of bytes received in blocks.")]
    pub data_received: Counter,
    #[metrics(help = "Number of blocks sent.")]
    pub blocks_sent: Counter,
    #[metrics(help = "Number of bytes sent in blocks.")]
    pub data_sent: Counter,
    pub haves_received: Counter,
    pub dont_haves_received: Counter,
    pub haves_sent: Counter,
    pub dont_haves_sent: Counter,

    /*
     * Wants
     */
    pub want_haves_sent: Counter,
    pub want_blocks_sent: Counter,
    pub cancels_sent: Counter,
    #[metrics(help = "Number of want entries received from peers.")]
    pub wants_received: Counter,
    #[metrics(help = "Number of cancel entries received from peers.")]
    pub cancels_received: Counter,

    /*
     * Peers
     */
    #[metrics(help = "Number of times a peer was demoted for not responding.")]
    pub unresponsive_peers: Counter,
    #[metrics(help = "Number of providers found through discovery.")]
    pub providers_found: Counter,
}
