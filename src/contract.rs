use ethers::prelude::abigen;

// Both sides of the bridge run the same contract, so one ABI serves the
// source and destination roles alike. Only the surface the relayer actually
// consumes is bound here; the rest of the bridge ABI (asset transfers,
// relayer staking, message execution) belongs to other participants.
#[allow(missing_docs)]
abigen!(
    BridgeContract,
    r#"[
        event MessageCreated(uint256 indexed chainId, address indexed from, bytes message)
        event MessageProcessed(uint256 indexed chainId, bytes32 messageHash)
        function relayerGetStatus(uint256 chainId, address relayerAddr) view returns (bool, uint64)
        function messageGetRelayers(uint256 chainId, bytes32 messageHash, uint64 epoch) view returns (address[8])
    ]"#
);

/// The number of relayers the bridge contract selects per (message, epoch).
pub const COMMITTEE_SIZE: usize = 8;
