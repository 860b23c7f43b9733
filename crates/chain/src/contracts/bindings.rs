//! ABI bindings for the Blueberry contracts the engine talks to.
//!
//! Only the stable external surface is bound: the bank's position views,
//! the core oracle, the flash-loan liquidator and plain ERC20.

use alloy::sol;

sol! {
    /// Bank position record, in on-chain field order.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct Position {
        address owner;
        address collToken;
        address underlyingToken;
        address debtToken;
        uint256 underlyingVaultShare;
        uint256 debtShare;
        uint256 collId;
        uint256 collateralSize;
    }

    #[sol(rpc)]
    interface IBlueberryBank {
        function isLiquidatable(uint256 positionId) external returns (bool);
        function getPositionInfo(uint256 positionId) external view returns (Position memory);
        function getNextPositionId() external view returns (uint256);
        function getPositionDebt(uint256 positionId) external returns (uint256);
        function getPositionValue(uint256 positionId) external returns (uint256);
        function getIsolatedCollateralValue(uint256 positionId) external returns (uint256);
        function execute(uint256 positionId, address spell, bytes memory data) external payable returns (uint256);
    }

    #[sol(rpc)]
    interface ICoreOracle {
        function getPrice(address token) external view returns (uint256);
        function getLiqThreshold(address token) external view returns (uint256);
        function setRoutes(address[] calldata tokens, address[] calldata routes) external;
        function setPrice(address[] calldata tokens, uint256[] calldata prices) external;
    }

    #[sol(rpc)]
    interface IBlueberryLiquidator {
        function liquidate(uint256 positionId) external;
        function withdraw(address[] calldata tokens) external;
        function owner() external view returns (address);
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}
