//! ABI fragments for the on-chain interfaces consumed by the daemon (§6).
//! ABI layout is fixed by the Catalyst protocol; the system works against
//! any endpoint exposing these selectors. One inline `abigen!` fragment per
//! logical contract, rather than a full generated artifact.

use ethers::contract::abigen;
use once_cell::sync::Lazy;

/// Raw ABI fragments, kept alongside the `abigen!` bindings below so calldata
/// can be encoded directly via `ethers::abi::Function::encode_input` without
/// depending on the exact identifiers the macro generates for each contract.
pub static ERC20_ABI: Lazy<ethers::abi::Abi> = Lazy::new(|| {
    serde_json::from_str(
        r#"[
            {"type":"function","name":"approve","stateMutability":"nonpayable","inputs":[{"name":"spender","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[{"name":"","type":"bool"}]},
            {"type":"function","name":"allowance","stateMutability":"view","inputs":[{"name":"owner","type":"address"},{"name":"spender","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
            {"type":"function","name":"balanceOf","stateMutability":"view","inputs":[{"name":"account","type":"address"}],"outputs":[{"name":"","type":"uint256"}]}
        ]"#,
    )
    .expect("embedded ERC20 ABI is valid")
});

pub static CATALYST_CHAIN_INTERFACE_ABI: Lazy<ethers::abi::Abi> = Lazy::new(|| {
    serde_json::from_str(
        r#"[
            {"type":"function","name":"underwrite","stateMutability":"payable","inputs":[{"name":"toVault","type":"address"},{"name":"toAsset","type":"address"},{"name":"units","type":"uint256"},{"name":"minOut","type":"uint256"},{"name":"toAccount","type":"address"},{"name":"underwriteIncentiveX16","type":"uint16"},{"name":"cdata","type":"bytes"}],"outputs":[{"name":"underwriteId","type":"bytes32"}]},
            {"type":"function","name":"expireUnderwrite","stateMutability":"nonpayable","inputs":[{"name":"toVault","type":"address"},{"name":"toAsset","type":"address"},{"name":"units","type":"uint256"},{"name":"minOut","type":"uint256"},{"name":"toAccount","type":"address"},{"name":"underwriteIncentiveX16","type":"uint16"},{"name":"cdata","type":"bytes"}],"outputs":[]}
        ]"#,
    )
    .expect("embedded CatalystChainInterface ABI is valid")
});

abigen!(
    CatalystVaultEvents,
    r#"[
        event SendAsset(bytes32 indexed channelId, bytes toVault, bytes toAccount, uint256 fromAmount, uint256 units, uint256 minOut, uint256 fee, uint16 underwriteIncentiveX16, address fromAsset, uint32 blockNumberMod)
    ]"#
);

abigen!(
    CatalystChainInterface,
    r#"[
        event SwapUnderwritten(bytes32 indexed underwriteId, address indexed underwriter, uint256 expiry)
        event FulfillUnderwrite(bytes32 indexed underwriteId)
        event UnderwriteSwap(bytes32 indexed underwriteId, address indexed underwriter)
        function underwrite(address toVault, address toAsset, uint256 units, uint256 minOut, address toAccount, uint16 underwriteIncentiveX16, bytes calldata cdata) external payable returns (bytes32 underwriteId)
        function expireUnderwrite(address toVault, address toAsset, uint256 units, uint256 minOut, address toAccount, uint16 underwriteIncentiveX16, bytes calldata cdata) external
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function approve(address spender, uint256 amount) external returns (bool)
        function allowance(address owner, address spender) external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
    ]"#
);
