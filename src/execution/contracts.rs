//! Compile-time ABI definitions for on-chain contracts via Alloy `sol!`.
//!
//! Encoding errors become compile errors; the swap layer never touches
//! runtime JSON ABIs.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

// ---------------------------------------------------------------------------
// ERC-20
// ---------------------------------------------------------------------------

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function symbol() external view returns (string);
        function name() external view returns (string);
    }
}

// ---------------------------------------------------------------------------
// V2 swapper proxy
// ---------------------------------------------------------------------------

sol! {
    /// Fee-on-transfer-aware swapper that wraps direct pair swaps. The tax
    /// argument lets the proxy widen its internal output check for taxed
    /// tokens instead of reverting.
    #[sol(rpc)]
    interface ISwapperProxy {
        function swap(
            address pair,
            uint256 amountIn,
            uint256 minOut,
            bool zeroForOne,
            uint256 taxBps
        ) external returns (uint256 amountOut);
    }
}

// ---------------------------------------------------------------------------
// V3 routers and pools
// ---------------------------------------------------------------------------

sol! {
    /// Uniswap V3 periphery SwapRouter (fee-addressed pools).
    #[sol(rpc)]
    interface IUniswapV3Router {
        struct ExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint24 fee;
            address recipient;
            uint256 deadline;
            uint256 amountIn;
            uint256 amountOutMinimum;
            uint160 sqrtPriceLimitX96;
        }
        function exactInputSingle(ExactInputSingleParams calldata params)
            external payable returns (uint256 amountOut);
    }

    /// Aerodrome Slipstream router — pools are addressed by tick spacing
    /// rather than fee tier.
    #[sol(rpc)]
    interface IAerodromeClRouter {
        struct ExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            int24 tickSpacing;
            address recipient;
            uint256 deadline;
            uint256 amountIn;
            uint256 amountOutMinimum;
            uint160 sqrtPriceLimitX96;
        }
        function exactInputSingle(ExactInputSingleParams calldata params)
            external payable returns (uint256 amountOut);
    }

    #[sol(rpc)]
    interface IV3Pool {
        function tickSpacing() external view returns (int24);
    }
}

// ---------------------------------------------------------------------------
// V4: Universal Router and Permit2
// ---------------------------------------------------------------------------

sol! {
    #[sol(rpc)]
    interface IUniversalRouter {
        function execute(bytes calldata commands, bytes[] calldata inputs, uint256 deadline)
            external payable;
    }

    #[sol(rpc)]
    interface IPermit2 {
        function allowance(address owner, address token, address spender)
            external view returns (uint160 amount, uint48 expiration, uint48 nonce);
        function approve(address token, address spender, uint160 amount, uint48 expiration)
            external;
    }
}

sol! {
    /// V4 pool identity: canonical (sorted) currency pair + fee + spacing + hooks.
    struct PoolKey {
        address currency0;
        address currency1;
        uint24 fee;
        int24 tickSpacing;
        address hooks;
    }

    /// Parameter block for the SWAP_EXACT_IN_SINGLE action.
    struct V4ExactInputSingleParams {
        PoolKey poolKey;
        bool zeroForOne;
        uint128 amountIn;
        uint128 amountOutMinimum;
        bytes hookData;
    }
}
