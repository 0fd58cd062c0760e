/*! Common utility functions
*/

use veil_crypto::random_u64;

/// Generate a non-zero transaction id.
pub fn gen_tx_id() -> u64 {
    let mut tx_id = 0;
    while tx_id == 0 {
        tx_id = random_u64();
    }
    tx_id
}
