use ethers::prelude::abigen;

// Read surface of the dollar pool diamond. `collateralInformation` returns a
// struct; callers decode it at token level.
abigen!(
    IDollarPool,
    r#"[
        struct CollateralInformation { uint256 index; string symbol; address collateralAddress; address collateralPriceFeedAddress; uint256 collateralPriceFeedStalenessThreshold; bool isEnabled; uint256 missingDecimals; uint256 price; uint256 poolCeiling; bool isMintPaused; bool isRedeemPaused; bool isBorrowPaused; uint256 mintingFee; uint256 redemptionFee; }
        function collateralRatio() external view returns (uint256)
        function getDollarPriceUsd() external view returns (uint256)
        function getGovernancePriceUsd() external view returns (uint256)
        function allCollaterals() external view returns (address[])
        function collateralInformation(address collateralAddress) external view returns (CollateralInformation memory returnData)
    ]"#
);
